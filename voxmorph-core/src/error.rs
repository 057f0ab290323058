use thiserror::Error;

/// All errors that can occur in voxmorph-core.
#[derive(Debug, Error)]
pub enum VoxmorphError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device available")]
    NoDefaultInputDevice,

    #[error("no default output device available")]
    NoDefaultOutputDevice,

    #[error("buffer contract violated: {0}")]
    BufferContract(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("stage {stage} returned tensor of shape {got:?}, expected {expected}")]
    ShapeMismatch {
        stage: &'static str,
        expected: String,
        got: Vec<usize>,
    },

    #[error("stream already running")]
    AlreadyRunning,

    #[error("stream not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxmorphError>;
