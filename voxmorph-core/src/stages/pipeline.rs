//! Typed wrappers over the raw tensor interface.
//!
//! Each wrapper owns the tensor naming and layout for one graph and
//! validates every output shape before the engine touches the data, so a
//! mis-exported model surfaces as a [`ShapeMismatch`] instead of silent
//! garbage downstream.
//!
//! [`ShapeMismatch`]: crate::error::VoxmorphError::ShapeMismatch

use crate::config::{DIM_CONTENT, DIM_SPEC, DIM_STYLE};
use crate::error::{Result, VoxmorphError};
use crate::stages::{take_output, BackendHandle, StageKind, Tensor, TensorMap};

/// Rows of the spectrogram skipped by the style encoder. The bottom bins
/// carry mostly rumble and are not part of its training distribution.
pub const STYLE_SPEC_ROW_OFFSET: usize = 48;

/// Per-frame outputs of the spectral analysis stage.
#[derive(Debug, Clone)]
pub struct SpectralFrames {
    /// Mel columns, oldest first. Each column has [`DIM_SPEC`] bins.
    pub spec_cols: Vec<Vec<f32>>,
    pub pitch: Vec<f32>,
    pub energy: Vec<f32>,
    pub activation: Vec<f32>,
}

impl SpectralFrames {
    pub fn frame_count(&self) -> usize {
        self.pitch.len()
    }
}

fn shape_err(stage: &'static str, expected: impl Into<String>, got: &[usize]) -> VoxmorphError {
    VoxmorphError::ShapeMismatch {
        stage,
        expected: expected.into(),
        got: got.to_vec(),
    }
}

/// Run the spectral stage over a 16 kHz window.
pub fn run_spectral_pitch(backend: &BackendHandle, wav16: &[f32]) -> Result<SpectralFrames> {
    let mut inputs = TensorMap::new();
    inputs.insert("input", Tensor::new(vec![1, wav16.len()], wav16.to_vec()));
    let mut out = backend.0.lock().run(StageKind::SpectralPitch, inputs)?;

    let spec = take_output(&mut out, "spectral_pitch", "spec")?;
    let pitch = take_output(&mut out, "spectral_pitch", "freq_t")?;
    let act = take_output(&mut out, "spectral_pitch", "act_t")?;
    let energy = take_output(&mut out, "spectral_pitch", "energy_t")?;

    if spec.shape.len() != 3 || spec.shape[0] != 1 || spec.shape[1] != DIM_SPEC {
        return Err(shape_err(
            "spectral_pitch",
            format!("[1, {DIM_SPEC}, T]"),
            &spec.shape,
        ));
    }
    let frames = spec.shape[2];
    for (name, t) in [("freq_t", &pitch), ("act_t", &act), ("energy_t", &energy)] {
        if t.data.len() != frames {
            return Err(shape_err(
                "spectral_pitch",
                format!("{name} with {frames} frames"),
                &t.shape,
            ));
        }
    }

    // Column-major split of the [bins, frames] plane.
    let spec_cols = (0..frames)
        .map(|t| (0..DIM_SPEC).map(|b| spec.data[b * frames + t]).collect())
        .collect();
    Ok(SpectralFrames {
        spec_cols,
        pitch: pitch.data,
        energy: energy.data,
        activation: act.data,
    })
}

/// Run the content encoder over a 16 kHz window, returning exactly
/// `out_frames` embedding frames (oldest first, [`DIM_CONTENT`] wide).
///
/// With a positive `expansion_rate` the window is padded: a noise prefix in
/// front and a reversed copy of the window behind, sized by the rate. The
/// padding gives the encoder context past both edges so the frames that
/// matter sit away from its boundary artifacts.
pub fn run_content_encode(
    backend: &BackendHandle,
    wav16: &[f32],
    noise_prefix: &[f32],
    expansion_rate: f32,
    out_frames: usize,
) -> Result<Vec<Vec<f32>>> {
    let signal = if expansion_rate > 0.0 {
        let reflect_len =
            ((wav16.len() as f32 * expansion_rate) as usize).min(wav16.len());
        let mut padded = Vec::with_capacity(noise_prefix.len() + wav16.len() + reflect_len);
        padded.extend_from_slice(noise_prefix);
        padded.extend_from_slice(wav16);
        padded.extend(wav16.iter().rev().take(reflect_len));
        padded
    } else {
        wav16.to_vec()
    };

    let mut inputs = TensorMap::new();
    inputs.insert("input", Tensor::new(vec![1, signal.len()], signal));
    let mut out = backend.0.lock().run(StageKind::ContentEncode, inputs)?;
    let emb = take_output(&mut out, "content_encode", "last_hidden_state")?;

    if emb.shape.len() != 3 || emb.shape[0] != 1 || emb.shape[2] != DIM_CONTENT {
        return Err(shape_err(
            "content_encode",
            format!("[1, T, {DIM_CONTENT}]"),
            &emb.shape,
        ));
    }
    let frames = emb.shape[1];
    if frames < out_frames {
        return Err(shape_err(
            "content_encode",
            format!("at least {out_frames} frames"),
            &emb.shape,
        ));
    }
    Ok((0..out_frames)
        .map(|t| emb.data[t * DIM_CONTENT..(t + 1) * DIM_CONTENT].to_vec())
        .collect())
}

/// Encode a style vector from a window of mel columns.
pub fn run_style_encode(backend: &BackendHandle, spec_cols: &[Vec<f32>]) -> Result<Vec<f32>> {
    let frames = spec_cols.len();
    let rows = DIM_SPEC - STYLE_SPEC_ROW_OFFSET;
    let mut data = Vec::with_capacity(rows * frames);
    for r in 0..rows {
        for col in spec_cols {
            data.push(col[STYLE_SPEC_ROW_OFFSET + r]);
        }
    }
    let mut inputs = TensorMap::new();
    inputs.insert("input", Tensor::new(vec![1, 1, rows, frames], data));
    let mut out = backend.0.lock().run(StageKind::StyleEncode, inputs)?;
    let style = take_output(&mut out, "style_encode", "output")?;
    if style.data.len() != DIM_STYLE {
        return Err(shape_err(
            "style_encode",
            format!("{DIM_STYLE} values"),
            &style.shape,
        ));
    }
    Ok(style.data)
}

/// Predicted pitch and energy tracks, two frames per content frame.
#[derive(Debug, Clone)]
pub struct PredictedTracks {
    pub pitch: Vec<f32>,
    pub energy: Vec<f32>,
}

pub fn run_pitch_energy_predict(
    backend: &BackendHandle,
    content_frames: &[Vec<f32>],
    style: &[f32],
) -> Result<PredictedTracks> {
    let frames = content_frames.len();
    let mut inputs = TensorMap::new();
    inputs.insert("content", content_to_channel_major(content_frames));
    inputs.insert("style", Tensor::new(vec![1, DIM_STYLE], style.to_vec()));
    let mut out = backend.0.lock().run(StageKind::PitchEnergyPredict, inputs)?;

    let pitch = take_output(&mut out, "pitch_energy_predict", "pred_F0")?;
    let energy = take_output(&mut out, "pitch_energy_predict", "pred_N")?;
    for (name, t) in [("pred_F0", &pitch), ("pred_N", &energy)] {
        if t.data.len() != frames * 2 {
            return Err(shape_err(
                "pitch_energy_predict",
                format!("{name} with {} frames", frames * 2),
                &t.shape,
            ));
        }
    }
    Ok(PredictedTracks {
        pitch: pitch.data,
        energy: energy.data,
    })
}

/// Decode one window to a 24 kHz waveform.
pub fn run_decode(
    backend: &BackendHandle,
    content_frames: &[Vec<f32>],
    pitch: &[f32],
    energy: &[f32],
    style: &[f32],
) -> Result<Vec<f32>> {
    let frames = content_frames.len();
    debug_assert_eq!(pitch.len(), frames * 2);
    debug_assert_eq!(energy.len(), frames * 2);

    let mut inputs = TensorMap::new();
    inputs.insert("content", content_to_channel_major(content_frames));
    inputs.insert("pitch", Tensor::new(vec![1, pitch.len()], pitch.to_vec()));
    inputs.insert("energy", Tensor::new(vec![1, energy.len()], energy.to_vec()));
    inputs.insert("style", Tensor::new(vec![1, DIM_STYLE], style.to_vec()));
    let mut out = backend.0.lock().run(StageKind::Decode, inputs)?;

    let wav = take_output(&mut out, "decode", "output")?;
    if wav.data.is_empty() {
        return Err(shape_err("decode", "non-empty waveform", &wav.shape));
    }
    Ok(wav.data)
}

/// Pack embedding frames as the `[1, DIM_CONTENT, T]` layout the predictor
/// and decoder graphs expect.
fn content_to_channel_major(frames: &[Vec<f32>]) -> Tensor {
    let t = frames.len();
    let mut data = vec![0.0f32; DIM_CONTENT * t];
    for (ti, frame) in frames.iter().enumerate() {
        for (ci, &v) in frame.iter().enumerate() {
            data[ci * t + ti] = v;
        }
    }
    Tensor::new(vec![1, DIM_CONTENT, t], data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::stub::StubBackend;
    use crate::stages::InferenceBackend;

    fn backend() -> BackendHandle {
        BackendHandle::new(StubBackend::new(2141))
    }

    #[test]
    fn spectral_outputs_line_up() {
        let wav = vec![0.01f32; 3200];
        let frames = run_spectral_pitch(&backend(), &wav).unwrap();
        assert_eq!(frames.frame_count(), 20);
        assert_eq!(frames.spec_cols.len(), 20);
        assert_eq!(frames.spec_cols[0].len(), DIM_SPEC);
        assert_eq!(frames.energy.len(), 20);
        assert_eq!(frames.activation.len(), 20);
    }

    #[test]
    fn content_truncates_to_requested_frames() {
        // 100 frames worth of signal plus padding headroom.
        let wav = vec![0.01f32; 100 * 320 + 80];
        let noise = vec![0.0f32; 2240];
        let frames = run_content_encode(&backend(), &wav, &noise, 0.1, 100).unwrap();
        assert_eq!(frames.len(), 100);
        assert_eq!(frames[0].len(), DIM_CONTENT);
    }

    #[test]
    fn content_without_expansion_skips_padding() {
        let wav = vec![0.01f32; 10 * 320 + 80];
        let frames = run_content_encode(&backend(), &wav, &[], 0.0, 10).unwrap();
        assert_eq!(frames.len(), 10);
    }

    #[test]
    fn style_vector_dimension() {
        let cols = vec![vec![-50.0f32; DIM_SPEC]; 200];
        let style = run_style_encode(&backend(), &cols).unwrap();
        assert_eq!(style.len(), DIM_STYLE);
    }

    #[test]
    fn predictor_doubles_frame_rate() {
        let content = vec![vec![0.0f32; DIM_CONTENT]; 80];
        let style = vec![0.0f32; DIM_STYLE];
        let tracks = run_pitch_energy_predict(&backend(), &content, &style).unwrap();
        assert_eq!(tracks.pitch.len(), 160);
        assert_eq!(tracks.energy.len(), 160);
    }

    #[test]
    fn decode_yields_waveform() {
        let content = vec![vec![0.0f32; DIM_CONTENT]; 30];
        let pitch = vec![220.0f32; 60];
        let energy = vec![0.1f32; 60];
        let style = vec![0.0f32; DIM_STYLE];
        let wav = run_decode(&backend(), &content, &pitch, &energy, &style).unwrap();
        assert_eq!(wav.len(), 30 * 480);
    }

    #[test]
    fn bad_backend_shape_is_rejected() {
        struct WrongShape;
        impl InferenceBackend for WrongShape {
            fn warm_up(&mut self) -> crate::error::Result<()> {
                Ok(())
            }
            fn run(
                &mut self,
                _stage: StageKind,
                _inputs: TensorMap,
            ) -> crate::error::Result<TensorMap> {
                let mut out = TensorMap::new();
                out.insert("spec", Tensor::zeros(vec![1, 10, 4]));
                out.insert("freq_t", Tensor::zeros(vec![1, 4]));
                out.insert("act_t", Tensor::zeros(vec![1, 4]));
                out.insert("energy_t", Tensor::zeros(vec![1, 4]));
                Ok(out)
            }
        }
        let backend = BackendHandle::new(WrongShape);
        let err = run_spectral_pitch(&backend, &[0.0; 640]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VoxmorphError::ShapeMismatch { .. }
        ));
    }
}
