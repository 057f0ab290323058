//! ONNX Runtime backend.
//!
//! Owns one `ort` session per stage graph. Session threading and the
//! execution-provider choice are tunable through environment variables:
//!
//! | Variable                     | Effect                                  |
//! |------------------------------|-----------------------------------------|
//! | `VOXMORPH_ORT_EP`            | `cpu`, `cuda` (strict) or `auto`        |
//! | `VOXMORPH_ORT_INTRA_THREADS` | intra-op thread count                   |
//! | `VOXMORPH_ORT_INTER_THREADS` | inter-op thread count                   |
//! | `VOXMORPH_ORT_PARALLEL`      | parallel graph execution (`1`/`true`)   |
//!
//! The default preference is `auto`: try CUDA, fall back to CPU silently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{ArrayD, IxDyn};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use tracing::{debug, info, warn};

use crate::config::{DIM_CONTENT, DIM_SPEC, DIM_STYLE};
use crate::error::{Result, VoxmorphError};
use crate::stages::pipeline::STYLE_SPEC_ROW_OFFSET;
use crate::stages::{InferenceBackend, StageKind, Tensor, TensorMap};

/// On-disk locations of the five exported graphs.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub spectral_pitch: PathBuf,
    pub content_encode: PathBuf,
    pub style_encode: PathBuf,
    pub pitch_energy_predict: PathBuf,
    pub decode: PathBuf,
}

impl ModelPaths {
    /// Conventional file names inside one model directory.
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            spectral_pitch: dir.join("harmof0.onnx"),
            content_encode: dir.join("contentvec.onnx"),
            style_encode: dir.join("style_encoder.onnx"),
            pitch_energy_predict: dir.join("f0n_predictor.onnx"),
            decode: dir.join("decoder.onnx"),
        }
    }

    fn for_stage(&self, stage: StageKind) -> &Path {
        match stage {
            StageKind::SpectralPitch => &self.spectral_pitch,
            StageKind::ContentEncode => &self.content_encode,
            StageKind::StyleEncode => &self.style_encode,
            StageKind::PitchEnergyPredict => &self.pitch_energy_predict,
            StageKind::Decode => &self.decode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrtExecutionPreference {
    Cpu,
    Cuda,
    Auto,
}

fn ort_execution_preference() -> OrtExecutionPreference {
    match std::env::var("VOXMORPH_ORT_EP")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "cpu" => OrtExecutionPreference::Cpu,
        "cuda" => OrtExecutionPreference::Cuda,
        _ => OrtExecutionPreference::Auto,
    }
}

fn create_session(model_path: &Path) -> Result<Session> {
    let pref = ort_execution_preference();
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("VOXMORPH_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(logical_cores.clamp(2, 12))
        .clamp(1, 32);
    let inter_threads = std::env::var("VOXMORPH_ORT_INTER_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, 8);
    let parallel_execution = std::env::var("VOXMORPH_ORT_PARALLEL")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut builder = SessionBuilder::new()
        .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?
        .with_inter_threads(inter_threads)
        .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?
        .with_parallel_execution(parallel_execution)
        .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?;
    debug!(
        intra_threads,
        inter_threads, parallel_execution, logical_cores, "ONNX session threading configured"
    );

    builder = match pref {
        OrtExecutionPreference::Cpu => {
            info!("ONNX EP preference=cpu");
            builder
                .with_execution_providers([ep::CPU::default().build()])
                .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?
        }
        OrtExecutionPreference::Cuda => {
            info!("ONNX EP preference=cuda (strict)");
            builder
                .with_execution_providers([
                    ep::CUDA::default()
                        .with_device_id(0)
                        .build()
                        .error_on_failure(),
                    ep::CPU::default().build(),
                ])
                .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?
        }
        OrtExecutionPreference::Auto => {
            info!("ONNX EP preference=auto (cuda -> cpu)");
            builder
                .with_execution_providers([
                    ep::CUDA::default().with_device_id(0).build().fail_silently(),
                    ep::CPU::default().build(),
                ])
                .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))?
        }
    };

    builder
        .commit_from_file(model_path)
        .map_err(|e| VoxmorphError::OnnxSession(e.to_string()))
}

pub struct OnnxBackend {
    paths: ModelPaths,
    sessions: HashMap<StageKind, Session>,
}

impl OnnxBackend {
    /// Load all five graphs. Every path must exist; a missing file fails
    /// here rather than mid-stream.
    pub fn new(paths: ModelPaths) -> Result<Self> {
        let mut sessions = HashMap::new();
        for stage in StageKind::ALL {
            let path = paths.for_stage(stage);
            if !path.exists() {
                return Err(VoxmorphError::ModelNotFound {
                    path: path.display().to_string(),
                });
            }
            let size_mb = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0) as f64 / 1e6;
            info!(stage = stage.name(), path = %path.display(), size_mb = format!("{size_mb:.1}"), "loading model");
            sessions.insert(stage, create_session(path)?);
        }
        Ok(Self { paths, sessions })
    }

    fn session(&mut self, stage: StageKind) -> Result<&mut Session> {
        self.sessions.get_mut(&stage).ok_or_else(|| {
            VoxmorphError::OnnxSession(format!("no session loaded for stage {}", stage.name()))
        })
    }

    fn run_session(&mut self, stage: StageKind, inputs: &TensorMap) -> Result<TensorMap> {
        let session = self.session(stage)?;
        let mut bound: Vec<(&'static str, SessionInputValue)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let array = ArrayD::from_shape_vec(IxDyn(&tensor.shape), tensor.data.clone())
                .map_err(|e| VoxmorphError::OnnxSession(format!("input {name:?}: {e}")))?;
            let value = Value::from_array(array)
                .map_err(|e| VoxmorphError::OnnxSession(format!("input {name:?}: {e}")))?;
            bound.push((*name, value.into()));
        }
        let outputs = session
            .run(bound)
            .map_err(|e| VoxmorphError::OnnxSession(format!("{}: {e}", stage.name())))?;

        let mut result = TensorMap::new();
        for &name in output_names(stage) {
            let value = outputs.get(name).ok_or_else(|| {
                VoxmorphError::OnnxSession(format!(
                    "{}: graph did not yield output {name:?}",
                    stage.name()
                ))
            })?;
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| VoxmorphError::OnnxSession(format!("{}/{name}: {e}", stage.name())))?;
            let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            result.insert(name, Tensor::new(shape, data.to_vec()));
        }
        Ok(result)
    }
}

fn output_names(stage: StageKind) -> &'static [&'static str] {
    match stage {
        StageKind::SpectralPitch => &["freq_t", "act_t", "energy_t", "spec"],
        StageKind::ContentEncode => &["last_hidden_state"],
        StageKind::StyleEncode => &["output"],
        StageKind::PitchEnergyPredict => &["pred_F0", "pred_N"],
        StageKind::Decode => &["output"],
    }
}

/// Representative probe inputs for the warm-up pass, shaped like one cycle
/// at the default geometry.
fn probe_inputs(stage: StageKind) -> (TensorMap, f64) {
    let mut inputs = TensorMap::new();
    let audio_secs = match stage {
        StageKind::SpectralPitch => {
            inputs.insert("input", Tensor::zeros(vec![1, 3200]));
            0.2
        }
        StageKind::ContentEncode => {
            inputs.insert("input", Tensor::zeros(vec![1, 100 * 320 + 80]));
            2.0
        }
        StageKind::StyleEncode => {
            let rows = DIM_SPEC - STYLE_SPEC_ROW_OFFSET;
            inputs.insert(
                "input",
                Tensor::new(vec![1, 1, rows, 200], vec![-50.0; rows * 200]),
            );
            2.0
        }
        StageKind::PitchEnergyPredict => {
            inputs.insert("content", Tensor::zeros(vec![1, DIM_CONTENT, 80]));
            inputs.insert("style", Tensor::zeros(vec![1, DIM_STYLE]));
            1.6
        }
        StageKind::Decode => {
            inputs.insert("content", Tensor::zeros(vec![1, DIM_CONTENT, 30]));
            inputs.insert("pitch", Tensor::new(vec![1, 60], vec![220.0; 60]));
            inputs.insert("energy", Tensor::new(vec![1, 60], vec![0.1; 60]));
            inputs.insert("style", Tensor::zeros(vec![1, DIM_STYLE]));
            0.6
        }
    };
    (inputs, audio_secs)
}

impl InferenceBackend for OnnxBackend {
    fn warm_up(&mut self) -> Result<()> {
        info!("=== Startup Report ===");
        for stage in StageKind::ALL {
            let path = self.paths.for_stage(stage).to_path_buf();
            {
                let session = self.session(stage)?;
                let input_names: Vec<_> =
                    session.inputs.iter().map(|i| i.name.clone()).collect();
                let output_names: Vec<_> =
                    session.outputs.iter().map(|o| o.name.clone()).collect();
                info!(
                    stage = stage.name(),
                    path = %path.display(),
                    inputs = ?input_names,
                    outputs = ?output_names,
                    "session ready"
                );
            }

            let (inputs, audio_secs) = probe_inputs(stage);
            let t0 = Instant::now();
            match self.run_session(stage, &inputs) {
                Ok(_) => {
                    let lap_ms = t0.elapsed().as_secs_f64() * 1e3;
                    let rtf = lap_ms / 1e3 / audio_secs;
                    info!(
                        stage = stage.name(),
                        lap_ms = format!("{lap_ms:.1}"),
                        rtf = format!("{rtf:.3}"),
                        "warm-up pass done"
                    );
                }
                Err(e) => {
                    warn!(stage = stage.name(), "warm-up pass failed: {e}");
                    return Err(e);
                }
            }
        }
        info!("=== Startup Report complete ===");
        Ok(())
    }

    fn run(&mut self, stage: StageKind, inputs: TensorMap) -> Result<TensorMap> {
        self.run_session(stage, &inputs)
    }
}
