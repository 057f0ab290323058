//! Periodic WAV capture of the raw and converted streams.
//!
//! The render thread appends blocks; once a flush interval of audio has
//! accumulated the buffered samples are handed to a detached writer thread,
//! so file I/O never runs on the audio path. Files are named
//! `i_{session}_{samples:011}.wav` / `o_{session}_{samples:011}.wav` where
//! `session` is the epoch second the recorder was created and `samples` is
//! the output sample count at the start of the segment.

use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, warn};

use crate::error::Result;

pub struct BlockRecorder {
    dir: PathBuf,
    sample_rate: u32,
    flush_every_samples: usize,
    session: u64,
    input_buf: Vec<f32>,
    output_buf: Vec<f32>,
    /// Output samples already flushed; start offset of the next segment.
    flushed: u64,
    writers: Vec<JoinHandle<()>>,
}

impl BlockRecorder {
    pub fn new(dir: PathBuf, sample_rate: u32, every_secs: f32) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let session = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let flush_every_samples = ((every_secs.max(0.1)) * sample_rate as f32) as usize;
        info!(dir = %dir.display(), every_secs, "block recorder armed");
        Ok(Self {
            dir,
            sample_rate,
            flush_every_samples,
            session,
            input_buf: Vec::with_capacity(flush_every_samples * 2),
            output_buf: Vec::with_capacity(flush_every_samples * 2),
            flushed: 0,
            writers: Vec::new(),
        })
    }

    pub fn push_input(&mut self, samples: &[f32]) {
        self.input_buf.extend_from_slice(samples);
    }

    /// Append converted output; flushes once the interval is full.
    pub fn push_output(&mut self, samples: &[f32]) {
        self.output_buf.extend_from_slice(samples);
        if self.output_buf.len() >= self.flush_every_samples {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.input_buf.is_empty() && self.output_buf.is_empty() {
            return;
        }
        let input = std::mem::take(&mut self.input_buf);
        let output = std::mem::take(&mut self.output_buf);
        let start = self.flushed;
        self.flushed += output.len() as u64;

        let dir = self.dir.clone();
        let rate = self.sample_rate;
        let session = self.session;
        let handle = std::thread::spawn(move || {
            for (prefix, samples) in [("i", input), ("o", output)] {
                if samples.is_empty() {
                    continue;
                }
                let path = dir.join(format!("{prefix}_{session}_{start:011}.wav"));
                if let Err(e) = write_wav(&path, rate, &samples) {
                    warn!(path = %path.display(), "recorder flush failed: {e}");
                }
            }
        });
        self.writers.push(handle);
    }
}

impl Drop for BlockRecorder {
    fn drop(&mut self) {
        self.flush();
        for handle in self.writers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn write_wav(path: &std::path::Path, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)
        .map_err(|e| crate::error::VoxmorphError::Io(std::io::Error::other(e)))?;
    for &s in samples {
        writer
            .write_sample(s)
            .map_err(|e| crate::error::VoxmorphError::Io(std::io::Error::other(e)))?;
    }
    writer
        .finalize()
        .map_err(|e| crate::error::VoxmorphError::Io(std::io::Error::other(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "voxmorph-rec-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn flushes_paired_segments() {
        let dir = scratch_dir("pair");
        {
            let mut rec = BlockRecorder::new(dir.clone(), 16_000, 0.1).unwrap();
            // Two flush intervals of audio.
            for _ in 0..8 {
                rec.push_input(&vec![0.1; 512]);
                rec.push_output(&vec![0.2; 512]);
            }
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert!(names.iter().any(|n| n.starts_with("i_")));
        assert!(names.iter().any(|n| n.starts_with("o_")));
        // Segment offsets are zero-padded to a fixed width.
        let first_out = names.iter().find(|n| n.starts_with("o_")).unwrap();
        assert!(first_out.ends_with("00000000000.wav"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn readback_matches_written_audio() {
        let dir = scratch_dir("readback");
        {
            let mut rec = BlockRecorder::new(dir.clone(), 16_000, 10.0).unwrap();
            rec.push_output(&[0.5, -0.5, 0.25]);
        }
        let name = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.file_name().unwrap().to_string_lossy().starts_with("o_"))
            .unwrap();
        let mut reader = hound::WavReader::open(name).unwrap();
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.5, -0.5, 0.25]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
