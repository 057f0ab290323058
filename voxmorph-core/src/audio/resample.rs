//! Sample-rate conversion.
//!
//! Three rates live in the pipeline: the device rate on both streams, 16 kHz
//! for the analysis models, and 24 kHz out of the decoder. [`RateConverter`]
//! is a streaming converter that keeps its filter state across blocks;
//! [`resample_chunk`] is the stateless one-shot variant for monitor and
//! offline paths.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{Result, VoxmorphError};

/// Streaming polyphase resampler for one mono signal.
///
/// Input arrives in arbitrary lengths; samples accumulate until a full
/// filter chunk is available, so a call may return nothing and a later call
/// returns the backlog. When the rates match the converter is a passthrough.
pub struct RateConverter {
    inner: Option<FastFixedIn<f32>>,
    chunk_size: usize,
    pending: Vec<f32>,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                inner: None,
                chunk_size,
                pending: Vec::new(),
                output_buf: Vec::new(),
            });
        }
        let ratio = to_rate as f64 / from_rate as f64;
        let inner = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| {
                VoxmorphError::AudioStream(format!(
                    "failed to build {from_rate}->{to_rate} resampler: {e}"
                ))
            })?;
        let output_buf = inner.output_buffer_allocate(true);
        Ok(Self {
            inner: Some(inner),
            chunk_size,
            pending: Vec::with_capacity(chunk_size * 2),
            output_buf,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed samples in, get converted samples out. Output length tracks the
    /// rate ratio over time but individual calls may return more or less
    /// while the accumulator fills and drains.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };
        self.pending.extend_from_slice(input);

        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            let (_in_used, out_written) = inner
                .process_into_buffer(&[chunk.as_slice()], &mut self.output_buf, None)
                .map_err(|e| VoxmorphError::AudioStream(format!("resampler failed: {e}")))?;
            out.extend_from_slice(&self.output_buf[0][..out_written]);
        }
        Ok(out)
    }

    /// Drop any accumulated partial chunk and the filter history.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("passthrough", &self.is_passthrough())
            .field("chunk_size", &self.chunk_size)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// One-shot conversion of a complete chunk. The input is processed as a
/// single filter chunk, so the whole signal is consumed in one call.
pub fn resample_chunk(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }
    let mut conv = RateConverter::new(from_rate, to_rate, input.len())?;
    conv.process(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut conv = RateConverter::new(48_000, 48_000, 1024).unwrap();
        assert!(conv.is_passthrough());
        let input = vec![0.25f32; 480];
        assert_eq!(conv.process(&input).unwrap(), input);
    }

    #[test]
    fn downsample_to_16k_length() {
        let mut conv = RateConverter::new(48_000, 16_000, 4800).unwrap();
        let input = vec![0.1f32; 4800];
        let out = conv.process(&input).unwrap();
        // One chunk in, roughly a third out.
        assert!((out.len() as i64 - 1600).unsigned_abs() < 10, "got {}", out.len());
    }

    #[test]
    fn upsample_decoder_rate() {
        let mut conv = RateConverter::new(24_000, 48_000, 2400).unwrap();
        let out = conv.process(&vec![0.0f32; 2400]).unwrap();
        assert!((out.len() as i64 - 4800).unsigned_abs() < 10, "got {}", out.len());
    }

    #[test]
    fn partial_input_accumulates() {
        let mut conv = RateConverter::new(48_000, 16_000, 4800).unwrap();
        assert!(conv.process(&vec![0.0f32; 2000]).unwrap().is_empty());
        assert!(conv.process(&vec![0.0f32; 2000]).unwrap().is_empty());
        // Third call crosses the chunk boundary and drains.
        let out = conv.process(&vec![0.0f32; 2000]).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn reset_discards_backlog() {
        let mut conv = RateConverter::new(48_000, 16_000, 4800).unwrap();
        conv.process(&vec![0.0f32; 3000]).unwrap();
        conv.reset();
        assert!(conv.process(&vec![0.0f32; 3000]).unwrap().is_empty());
    }

    #[test]
    fn one_shot_chunk_conversion() {
        let input: Vec<f32> = (0..2400).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample_chunk(&input, 24_000, 16_000).unwrap();
        assert!((out.len() as i64 - 1600).unsigned_abs() < 10, "got {}", out.len());
    }
}
