//! The five-stage conversion pipeline and its inference backends.
//!
//! Stages talk to a backend through name-keyed tensors, mirroring the model
//! graphs' input and output bindings. The engine only sees the typed
//! wrappers in [`pipeline`]; the backend behind them is either the ort
//! runtime (`onnx` feature) or the deterministic stub used by tests and the
//! benchmark.

pub mod pipeline;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, VoxmorphError};

/// Row-major float tensor with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Length of one trailing axis element group, e.g. a row of a 2-D tensor.
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }
}

/// Name-keyed tensors crossing the backend boundary.
pub type TensorMap = HashMap<&'static str, Tensor>;

/// The five model graphs, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Waveform to mel spectrogram, pitch, energy and voicing activation.
    SpectralPitch,
    /// Waveform to content embedding frames.
    ContentEncode,
    /// Mel spectrogram window to a style vector.
    StyleEncode,
    /// Content plus style to predicted pitch and energy tracks.
    PitchEnergyPredict,
    /// Content, pitch, energy and style to a 24 kHz waveform.
    Decode,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::SpectralPitch,
        StageKind::ContentEncode,
        StageKind::StyleEncode,
        StageKind::PitchEnergyPredict,
        StageKind::Decode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::SpectralPitch => "spectral_pitch",
            StageKind::ContentEncode => "content_encode",
            StageKind::StyleEncode => "style_encode",
            StageKind::PitchEnergyPredict => "pitch_energy_predict",
            StageKind::Decode => "decode",
        }
    }
}

/// A pluggable inference runtime behind the stage wrappers.
///
/// `run` takes `&mut self`: real sessions keep scratch allocations between
/// calls. Callers share a backend through [`BackendHandle`], which wraps it
/// in a `parking_lot::Mutex`; the render thread is the only caller on the
/// hot path, so the lock is uncontended there.
pub trait InferenceBackend: Send + 'static {
    /// Run every graph once on dummy data so first-cycle latency is paid at
    /// startup, not mid-stream.
    fn warm_up(&mut self) -> Result<()>;

    fn run(&mut self, stage: StageKind, inputs: TensorMap) -> Result<TensorMap>;
}

/// Shared, clonable handle to a boxed backend.
#[derive(Clone)]
pub struct BackendHandle(pub Arc<Mutex<dyn InferenceBackend>>);

impl BackendHandle {
    pub fn new<B: InferenceBackend>(backend: B) -> Self {
        Self(Arc::new(Mutex::new(backend)))
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle").finish_non_exhaustive()
    }
}

/// Pull one named tensor out of a stage's outputs.
pub fn take_output(
    outputs: &mut TensorMap,
    stage: &'static str,
    name: &'static str,
) -> Result<Tensor> {
    outputs.remove(name).ok_or_else(|| {
        VoxmorphError::Inference(format!("stage {stage} produced no output named {name:?}"))
    })
}
