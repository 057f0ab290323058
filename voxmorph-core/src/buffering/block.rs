//! Block types moved between the capture and render callbacks.

/// One fixed-size mono block at the device rate. The capture side always
/// assembles full blocks; a short block never crosses the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn silent(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// An [`AudioBlock`] plus the capture-side measurements the render side
/// needs: the gate decision, the measured level and a monotonic sequence
/// number for drop accounting.
#[derive(Debug, Clone)]
pub struct TaggedBlock {
    pub block: AudioBlock,
    pub voiced: bool,
    pub dbfs: f32,
    pub seq: u64,
}

impl TaggedBlock {
    pub fn new(block: AudioBlock, voiced: bool, dbfs: f32, seq: u64) -> Self {
        Self {
            block,
            voiced,
            dbfs,
            seq,
        }
    }
}
