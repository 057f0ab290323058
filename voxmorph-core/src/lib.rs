//! voxmorph-core: low-latency streaming voice conversion.
//!
//! Captured microphone audio is cut into fixed-size blocks, gated on level,
//! and either passed through unchanged or converted through a five-stage
//! neural pipeline, then crossfaded back into a seamless output stream:
//!
//! ```text
//!  capture callback                      render callback
//!  ┌──────────────────┐   TaggedBlock    ┌─────────────────────────────┐
//!  │ mic + side mix   │   queue (SPSC,   │ ConversionEngine            │
//!  │ gain → dBFS      ├─────bounded─────▶│  spectral → content → style │
//!  │ VoiceGate        │                  │  → pitch/energy → decode    │
//!  └──────────────────┘                  │  → crossfade → one block    │
//!                                        └─────────────────────────────┘
//! ```
//!
//! [`StreamSupervisor`] owns the lifecycle: validate config, warm the
//! backend up, start/stop the duplex streams, reconfigure live. The model
//! stages run on ONNX Runtime behind the `onnx` feature; without it the
//! deterministic [`StubBackend`] keeps the whole pipeline testable.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod record;
pub mod stages;
pub mod style;
pub mod supervisor;

// Convenience re-exports.
pub use config::{ConfigPatch, ConversionMode, EngineConfig, SpecMonitorPolicy};
pub use engine::{ConversionEngine, EngineMetrics, MetricsSnapshot};
pub use error::{Result, VoxmorphError};
pub use stages::stub::StubBackend;
pub use stages::BackendHandle;
pub use style::{StyleHandle, StyleVector};
pub use supervisor::{StreamSupervisor, SupervisorStatus};

#[cfg(feature = "onnx")]
pub use stages::onnx::{ModelPaths, OnnxBackend};
