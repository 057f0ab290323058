//! Deterministic stand-in backend.
//!
//! Produces shape-correct tensors from a seeded hash of the inputs, so the
//! full pipeline runs without model files and two runs over the same blocks
//! are bit-identical. Used by tests and as the benchmark fallback.

use tracing::debug;

use crate::config::{DIM_CONTENT, DIM_SPEC, DIM_STYLE};
use crate::error::{Result, VoxmorphError};
use crate::stages::{InferenceBackend, StageKind, Tensor, TensorMap};

/// Samples per spectrogram frame at 16 kHz (10 ms hop).
const SPEC_FRAME_HOP: usize = 160;
/// Decoder output samples per pitch frame (10 ms at 24 kHz).
const DECODE_FRAME_LEN: usize = 240;

pub struct StubBackend {
    seed: u64,
}

impl StubBackend {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn mix(&self, a: u64, b: u64) -> f32 {
        let mut h = self
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(a.wrapping_mul(0xD1B5_4A32_D192_ED03))
            ^ b.wrapping_mul(0x8CB9_2BA7_2F3D_8DD7);
        h ^= h >> 33;
        h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        h ^= h >> 33;
        (h >> 40) as f32 / (1u64 << 24) as f32 - 0.5
    }
}

fn checksum(data: &[f32]) -> u64 {
    data.iter()
        .fold(0u64, |acc, v| acc.rotate_left(1) ^ u64::from(v.to_bits()))
}

fn require<'a>(inputs: &'a TensorMap, name: &'static str) -> Result<&'a Tensor> {
    inputs
        .get(name)
        .ok_or_else(|| VoxmorphError::Inference(format!("stub: missing input {name:?}")))
}

impl InferenceBackend for StubBackend {
    fn warm_up(&mut self) -> Result<()> {
        debug!("stub backend warm-up (no sessions to prime)");
        Ok(())
    }

    fn run(&mut self, stage: StageKind, inputs: TensorMap) -> Result<TensorMap> {
        let mut out = TensorMap::new();
        match stage {
            StageKind::SpectralPitch => {
                let wav = require(&inputs, "input")?;
                let frames = wav.data.len() / SPEC_FRAME_HOP;
                let key = checksum(&wav.data);

                let mut spec = Vec::with_capacity(DIM_SPEC * frames);
                for b in 0..DIM_SPEC {
                    for t in 0..frames {
                        spec.push(-50.0 + 8.0 * self.mix(key ^ b as u64, t as u64));
                    }
                }
                // Energy tracks the actual frame RMS so gate-adjacent tests
                // see plausible dynamics.
                let energy: Vec<f32> = (0..frames)
                    .map(|t| {
                        let seg = &wav.data[t * SPEC_FRAME_HOP..(t + 1) * SPEC_FRAME_HOP];
                        (seg.iter().map(|s| s * s).sum::<f32>() / seg.len() as f32).sqrt()
                    })
                    .collect();
                let pitch: Vec<f32> = (0..frames)
                    .map(|t| 150.0 + 80.0 * (0.5 + self.mix(key, t as u64)))
                    .collect();
                let act: Vec<f32> = (0..frames)
                    .map(|t| (0.6 + self.mix(key.rotate_left(17), t as u64)).clamp(0.0, 1.0))
                    .collect();

                out.insert("spec", Tensor::new(vec![1, DIM_SPEC, frames], spec));
                out.insert("freq_t", Tensor::new(vec![1, frames], pitch));
                out.insert("act_t", Tensor::new(vec![1, frames], act));
                out.insert("energy_t", Tensor::new(vec![1, frames], energy));
            }
            StageKind::ContentEncode => {
                let wav = require(&inputs, "input")?;
                let frames = wav.data.len().saturating_sub(80) / 320;
                let key = checksum(&wav.data);
                let data: Vec<f32> = (0..frames * DIM_CONTENT)
                    .map(|i| 0.1 * self.mix(key, i as u64))
                    .collect();
                out.insert(
                    "last_hidden_state",
                    Tensor::new(vec![1, frames, DIM_CONTENT], data),
                );
            }
            StageKind::StyleEncode => {
                let spec = require(&inputs, "input")?;
                let key = checksum(&spec.data);
                let data: Vec<f32> = (0..DIM_STYLE)
                    .map(|i| self.mix(key, i as u64))
                    .collect();
                out.insert("output", Tensor::new(vec![1, DIM_STYLE], data));
            }
            StageKind::PitchEnergyPredict => {
                let content = require(&inputs, "content")?;
                let style = require(&inputs, "style")?;
                let frames = content.last_dim() * 2;
                let key = checksum(&content.data) ^ checksum(&style.data);
                let pitch: Vec<f32> = (0..frames)
                    .map(|t| 180.0 + 60.0 * self.mix(key, t as u64))
                    .collect();
                let energy: Vec<f32> = (0..frames)
                    .map(|t| 0.1 + 0.05 * self.mix(key.rotate_left(31), t as u64))
                    .collect();
                out.insert("pred_F0", Tensor::new(vec![1, frames], pitch));
                out.insert("pred_N", Tensor::new(vec![1, frames], energy));
            }
            StageKind::Decode => {
                let content = require(&inputs, "content")?;
                let pitch = require(&inputs, "pitch")?;
                let energy = require(&inputs, "energy")?;
                let frames = content.last_dim();
                let samples = frames * 2 * DECODE_FRAME_LEN;
                // A sine following the requested pitch and energy tracks.
                let mut data = Vec::with_capacity(samples);
                let mut phase = 0.0f32;
                for i in 0..samples {
                    let frame = i / DECODE_FRAME_LEN;
                    let f = pitch.data.get(frame).copied().unwrap_or(220.0);
                    let a = energy.data.get(frame).copied().unwrap_or(0.1);
                    phase += std::f32::consts::TAU * f / 24_000.0;
                    data.push(a * phase.sin());
                }
                out.insert("output", Tensor::new(vec![1, 1, samples], data));
            }
        }
        Ok(out)
    }
}
