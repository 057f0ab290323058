//! Duplex audio I/O via the cpal backend.
//!
//! # Design constraints
//!
//! The capture callback runs on an OS audio thread at elevated priority. It
//! stays cheap: mono mixdown, side-channel mix from a lock-free ring, gain,
//! one dBFS measurement and a non-blocking enqueue. It never waits on the
//! render side.
//!
//! The render callback is the engine's home: it pops tagged blocks and runs
//! the conversion cycle synchronously, keeping output latency at one queue
//! hop. When the cycle overruns, the staged output underruns and the
//! callback emits silence for the shortfall.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`DuplexAudioLoop`] must be created and dropped on the same
//! thread; the supervisor does both inside one `spawn_blocking` task.

pub mod device;
pub mod resample;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
use ringbuf::traits::Consumer;
use tracing::{error, info, warn};

use crate::buffering::{
    create_block_queue, next_block, offer_block, AudioBlock, BlockReceiver, BlockSender,
    SideConsumer, TaggedBlock,
};
use crate::config::{EngineConfig, SharedControls};
use crate::engine::{ConversionEngine, EngineMetrics};
use crate::error::{Result, VoxmorphError};
use crate::gate::{dbfs_level, VoiceGate};
use crate::record::BlockRecorder;

fn db_to_amp(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Everything the duplex loop needs at open time.
pub struct DuplexParams {
    pub config: Arc<EngineConfig>,
    pub engine: ConversionEngine,
    pub controls: Arc<SharedControls>,
    pub metrics: Arc<EngineMetrics>,
    pub side: SideConsumer,
    pub recorder: Option<BlockRecorder>,
    pub running: Arc<AtomicBool>,
}

/// Capture-side state owned by the input callback.
struct CaptureCtx {
    block_size: usize,
    staging: Vec<f32>,
    side_buf: Vec<f32>,
    gate: VoiceGate,
    side: SideConsumer,
    tx: BlockSender,
    controls: Arc<SharedControls>,
    metrics: Arc<EngineMetrics>,
}

impl CaptureCtx {
    fn new(
        cfg: &EngineConfig,
        side: SideConsumer,
        tx: BlockSender,
        controls: Arc<SharedControls>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            block_size: cfg.block_size(),
            staging: Vec::with_capacity(cfg.block_size() * 2),
            side_buf: Vec::new(),
            gate: VoiceGate::new(cfg.gate_threshold_dbfs, cfg.keep_voiced),
            side,
            tx,
            controls,
            metrics,
        }
    }

    /// Mix gains and the side channel into `mono`, then cut full blocks and
    /// hand them to the render side.
    fn ingest(&mut self, mono: &[f32]) {
        let gain = db_to_amp(self.controls.mic_gain_db());
        let side_gain = db_to_amp(self.controls.side_gain_db());

        self.side_buf.resize(mono.len(), 0.0);
        let popped = self.side.pop_slice(&mut self.side_buf);
        self.side_buf[popped..].fill(0.0);

        self.staging.extend(
            mono.iter()
                .zip(&self.side_buf)
                .map(|(m, s)| m * gain + s * side_gain),
        );

        while self.staging.len() >= self.block_size {
            let samples: Vec<f32> = self.staging.drain(..self.block_size).collect();
            let dbfs = dbfs_level(&samples);

            self.gate.set_live(self.controls.engine_live());
            self.gate.set_threshold(self.controls.gate_threshold_dbfs());
            self.gate.set_keep_voiced(self.controls.keep_voiced());
            let voiced = self.gate.update(dbfs);

            let seq = self.controls.bump_head_in();
            let tagged = TaggedBlock::new(AudioBlock::new(samples), voiced, dbfs, seq);
            if !offer_block(&self.tx, tagged) {
                self.metrics.dropped_blocks.fetch_add(1, Ordering::Relaxed);
                warn!(seq, "block queue full, dropped newest block");
            }
        }
    }
}

/// Render-side state owned by the output callback.
struct RenderCtx {
    engine: ConversionEngine,
    rx: BlockReceiver,
    staged: VecDeque<f32>,
    controls: Arc<SharedControls>,
    metrics: Arc<EngineMetrics>,
    recorder: Option<BlockRecorder>,
}

impl RenderCtx {
    fn new(
        engine: ConversionEngine,
        rx: BlockReceiver,
        controls: Arc<SharedControls>,
        metrics: Arc<EngineMetrics>,
        recorder: Option<BlockRecorder>,
    ) -> Self {
        Self {
            engine,
            rx,
            staged: VecDeque::new(),
            controls,
            metrics,
            recorder,
        }
    }

    /// Produce exactly `out.len()` mono samples, running engine cycles as
    /// queued blocks allow and padding any shortfall with silence.
    fn fill(&mut self, out: &mut [f32]) {
        let drain_unvoiced = self.controls.drain_unvoiced();
        while self.staged.len() < out.len() {
            let Some((tagged, drained)) = next_block(&self.rx, drain_unvoiced) else {
                break;
            };
            if drained > 0 {
                self.metrics.drained_blocks.fetch_add(drained, Ordering::Relaxed);
            }
            self.metrics.queue_depth.store(self.rx.len(), Ordering::Relaxed);

            if let Some(rec) = self.recorder.as_mut() {
                rec.push_input(&tagged.block.samples);
            }
            let rendered = self.engine.process_block(&tagged.block, tagged.voiced);
            if let Some(rec) = self.recorder.as_mut() {
                rec.push_output(&rendered);
            }
            self.staged.extend(rendered);
            self.controls.mark_engine_live();
            self.controls.bump_head_out();
        }

        let level = if self.controls.is_muted() { 0.0 } else { 1.0 };
        let have = self.staged.len().min(out.len());
        for (o, s) in out[..have].iter_mut().zip(self.staged.drain(..have)) {
            *o = s * level;
        }
        out[have..].fill(0.0);
    }
}

/// Handle to the running capture and render streams.
///
/// **Not `Send`**: create and drop on the same OS thread.
pub struct DuplexAudioLoop {
    #[cfg(feature = "audio-cpal")]
    _input: Stream,
    #[cfg(feature = "audio-cpal")]
    _output: Stream,
    running: Arc<AtomicBool>,
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
fn find_device(
    host: &cpal::Host,
    preferred: Option<&str>,
    input: bool,
) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    let list = |host: &cpal::Host| -> Result<Vec<cpal::Device>> {
        let iter = if input {
            host.input_devices()
        } else {
            host.output_devices()
        };
        Ok(iter
            .map_err(|e| VoxmorphError::AudioDevice(e.to_string()))?
            .collect())
    };

    if let Some(name) = preferred {
        match list(host) {
            Ok(devices) => {
                for device in devices {
                    if device.name().map(|n| n == name).unwrap_or(false) {
                        return Ok(device);
                    }
                }
                warn!("preferred device '{name}' not found, falling back");
            }
            Err(e) => warn!("failed to list devices while resolving preference: {e}"),
        }
    }

    let default = if input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    if let Some(device) = default {
        return Ok(device);
    }

    let mut devices = list(host)?.into_iter();
    let fallback = devices.next().ok_or(if input {
        VoxmorphError::NoDefaultInputDevice
    } else {
        VoxmorphError::NoDefaultOutputDevice
    })?;
    warn!("no default device, falling back to first available");
    Ok(fallback)
}

#[cfg(feature = "audio-cpal")]
impl DuplexAudioLoop {
    /// Open both streams at the configured rate and start them.
    ///
    /// Must be called from the thread that will also drop this value; in
    /// practice that means inside `tokio::task::spawn_blocking`.
    pub fn open(params: DuplexParams) -> Result<Self> {
        use cpal::traits::HostTrait;

        let DuplexParams {
            config,
            engine,
            controls,
            metrics,
            side,
            recorder,
            running,
        } = params;

        let host = cpal::default_host();
        let input_device = find_device(&host, config.input_device.as_deref(), true)?;
        let output_device = find_device(&host, config.output_device.as_deref(), false)?;
        info!(
            input = input_device.name().unwrap_or_default().as_str(),
            output = output_device.name().unwrap_or_default().as_str(),
            sample_rate = config.sample_rate_out,
            block_size = config.block_size(),
            "opening duplex streams"
        );

        let (tx, rx) = create_block_queue();
        let mut capture = CaptureCtx::new(&config, side, tx, controls.clone(), metrics.clone());
        let mut render = RenderCtx::new(engine, rx, controls, metrics, recorder);

        // ── Input stream ─────────────────────────────────────────────────
        let supported_in = input_device
            .default_input_config()
            .map_err(|e| VoxmorphError::AudioDevice(e.to_string()))?;
        let in_channels = supported_in.channels();
        let in_config = StreamConfig {
            channels: in_channels,
            sample_rate: SampleRate(config.sample_rate_out),
            buffer_size: cpal::BufferSize::Default,
        };

        let running_in = Arc::clone(&running);
        let input_stream = match supported_in.sample_format() {
            SampleFormat::F32 => {
                let ch = in_channels as usize;
                let mut mono: Vec<f32> = Vec::new();
                input_device.build_input_stream(
                    &in_config,
                    move |data: &[f32], _info| {
                        if !running_in.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        for f in 0..frames {
                            let base = f * ch;
                            let sum: f32 = data[base..base + ch].iter().sum();
                            mono[f] = sum / ch as f32;
                        }
                        capture.ingest(&mono);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I16 => {
                let ch = in_channels as usize;
                let mut mono: Vec<f32> = Vec::new();
                input_device.build_input_stream(
                    &in_config,
                    move |data: &[i16], _info| {
                        if !running_in.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        for f in 0..frames {
                            let base = f * ch;
                            let mut sum = 0f32;
                            for c in 0..ch {
                                sum += data[base + c] as f32 / 32768.0;
                            }
                            mono[f] = sum / ch as f32;
                        }
                        capture.ingest(&mono);
                    },
                    |err| error!("input stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(VoxmorphError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VoxmorphError::AudioStream(e.to_string()))?;

        // ── Output stream ────────────────────────────────────────────────
        let supported_out = output_device
            .default_output_config()
            .map_err(|e| VoxmorphError::AudioDevice(e.to_string()))?;
        let out_channels = supported_out.channels();
        let out_config = StreamConfig {
            channels: out_channels,
            sample_rate: SampleRate(config.sample_rate_out),
            buffer_size: cpal::BufferSize::Default,
        };

        let running_out = Arc::clone(&running);
        let output_stream = match supported_out.sample_format() {
            SampleFormat::F32 => {
                let ch = out_channels as usize;
                let mut mono: Vec<f32> = Vec::new();
                output_device.build_output_stream(
                    &out_config,
                    move |data: &mut [f32], _info| {
                        if !running_out.load(Ordering::Relaxed) {
                            data.fill(0.0);
                            return;
                        }
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        render.fill(&mut mono);
                        for f in 0..frames {
                            let base = f * ch;
                            data[base..base + ch].fill(mono[f]);
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I16 => {
                let ch = out_channels as usize;
                let mut mono: Vec<f32> = Vec::new();
                output_device.build_output_stream(
                    &out_config,
                    move |data: &mut [i16], _info| {
                        if !running_out.load(Ordering::Relaxed) {
                            data.fill(0);
                            return;
                        }
                        let frames = data.len() / ch;
                        mono.resize(frames, 0.0);
                        render.fill(&mut mono);
                        for f in 0..frames {
                            let s = (mono[f].clamp(-1.0, 1.0) * 32767.0) as i16;
                            let base = f * ch;
                            data[base..base + ch].fill(s);
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(VoxmorphError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VoxmorphError::AudioStream(e.to_string()))?;

        input_stream
            .play()
            .map_err(|e| VoxmorphError::AudioStream(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| VoxmorphError::AudioStream(e.to_string()))?;

        Ok(Self {
            _input: input_stream,
            _output: output_stream,
            running,
            sample_rate: config.sample_rate_out,
        })
    }

    /// Signal both callbacks to no-op on their next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl DuplexAudioLoop {
    pub fn open(_params: DuplexParams) -> Result<Self> {
        Err(VoxmorphError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
