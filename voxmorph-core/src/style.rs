//! Target style vectors and the shared slot the render side reads them from.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::DIM_STYLE;
use crate::error::{Result, VoxmorphError};

/// A speaker embedding the decoder renders toward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleVector {
    values: Vec<f32>,
}

impl StyleVector {
    pub fn from_vec(values: Vec<f32>) -> Result<Self> {
        if values.len() != DIM_STYLE {
            return Err(VoxmorphError::Config(format!(
                "style vector has {} values, expected {DIM_STYLE}",
                values.len()
            )));
        }
        Ok(Self { values })
    }

    /// The all-zero style. Decoders treat it as a neutral voice; it is the
    /// slot content until a real embedding is loaded.
    pub fn neutral() -> Self {
        Self {
            values: vec![0.0; DIM_STYLE],
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Single-slot style exchange between callers and the render thread.
///
/// The slot holds an `Arc<StyleVector>`; the render side clones the `Arc`
/// once per cycle, so a concurrent [`replace`] never tears a vector
/// mid-cycle. A cycle uses exactly one style end to end.
///
/// [`replace`]: StyleHandle::replace
#[derive(Debug, Clone)]
pub struct StyleHandle {
    slot: Arc<RwLock<Arc<StyleVector>>>,
}

impl Default for StyleHandle {
    fn default() -> Self {
        Self::new(StyleVector::neutral())
    }
}

impl StyleHandle {
    pub fn new(style: StyleVector) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(style))),
        }
    }

    pub fn snapshot(&self) -> Arc<StyleVector> {
        self.slot.read().clone()
    }

    pub fn replace(&self, style: StyleVector) {
        *self.slot.write() = Arc::new(style);
    }
}
