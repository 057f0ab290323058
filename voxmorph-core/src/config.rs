//! Engine configuration.
//!
//! [`EngineConfig`] is the full, serde-friendly description of one engine
//! instance. A validated config is immutable once the streams are running;
//! live parameter changes go through [`ConfigPatch`], which is split into
//! fields that can be swapped between cycles and fields that force a full
//! stream restart (see [`ConfigPatch::requires_restart`]).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxmorphError};

/// Analysis rate expected by the spectral and content models.
pub const SR_PROC: u32 = 16_000;
/// Rate the decoder synthesizes at.
pub const SR_DECODE: u32 = 24_000;
/// Spectrogram hop at the analysis rate (20 ms frames).
pub const SPEC_HOP: usize = 320;
/// Mel bins produced by the spectral stage.
pub const DIM_SPEC: usize = 352;
/// Content embedding width.
pub const DIM_CONTENT: usize = 768;
/// Style embedding width.
pub const DIM_STYLE: usize = 128;

/// What the engine does with each incoming block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    /// Follow the voice gate: convert voiced blocks, bypass silence.
    #[default]
    Auto,
    /// Never run the conversion stages; emit input unchanged.
    ForceBypass,
    /// Run the conversion stages on every block, gate or not.
    ForceConvert,
}

/// When a monitoring spectrogram ring is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpecMonitorPolicy {
    /// Refresh on every cycle, converting or not.
    Always,
    /// Refresh only on cycles that ran the conversion stages.
    #[default]
    WhileConverting,
    /// Never refresh.
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Preferred input device name; `None` picks the default microphone.
    pub input_device: Option<String>,
    /// Preferred output device name; `None` picks the default sink.
    pub output_device: Option<String>,
    /// Device-side sample rate. Both streams open at this rate.
    pub sample_rate_out: u32,
    /// Spectrogram frames advanced per block. One frame is 20 ms, so the
    /// block length is `block_roll * 0.02 * sample_rate_out` samples.
    pub block_roll: usize,
    /// History depth of the waveform rings, in seconds.
    pub sec_wav_buffer: f32,

    pub mic_gain_db: f32,
    pub side_gain_db: f32,
    pub gate_threshold_dbfs: f32,
    /// Extra blocks the gate stays open after the level drops.
    pub keep_voiced: usize,
    /// Drop queued unvoiced blocks instead of playing them back.
    pub drain_unvoiced: bool,
    pub mode: ConversionMode,
    pub monitor_input: SpecMonitorPolicy,
    pub monitor_output: SpecMonitorPolicy,
    pub mute: bool,

    pub pitch_shift_semitones: f32,
    /// Use the predicted absolute pitch track instead of the source pitch.
    pub absolute_pitch: bool,
    /// Use the predicted energy track instead of the source energy.
    pub estimate_energy: bool,
    /// Re-encode the style vector from the input spectrogram every cycle.
    pub auto_encode_style: bool,
    /// Fraction of the content window mirrored onto its end before encoding.
    /// Zero disables both the reflection pad and the noise prefix.
    pub expansion_rate: f32,

    /// Columns held by the spectrogram history rings.
    pub n_buffer_spec: usize,
    /// Spectrogram frames fed to the spectral stage per cycle.
    pub len_spec: usize,
    /// Content frames fed to the content encoder per cycle.
    pub len_content: usize,
    /// Spectrogram frames fed to the style encoder.
    pub len_style_encoder: usize,
    /// Content frames fed to the pitch/energy predictor.
    pub len_f0n_predictor: usize,
    /// Content frames fed to the decoder per cycle.
    pub len_proc: usize,
    /// Crossfade overlap, in output samples. Must stay below the block size.
    pub fade_len: usize,

    pub substitute_all_spec: bool,
    pub substitute_all_content: bool,
    pub substitute_all_f0n: bool,

    /// Consecutive stage faults before the engine is flagged stalled.
    pub stage_fault_budget: usize,

    /// Flush the recorder this often; zero disables recording.
    pub record_every_secs: f32,
    pub record_dir: Option<PathBuf>,

    /// Seed for the priming noise written into fresh history rings.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate_out: 48_000,
            block_roll: 7,
            sec_wav_buffer: 16.0,
            mic_gain_db: 0.0,
            side_gain_db: 0.0,
            gate_threshold_dbfs: -40.0,
            keep_voiced: 1,
            drain_unvoiced: false,
            mode: ConversionMode::Auto,
            monitor_input: SpecMonitorPolicy::WhileConverting,
            monitor_output: SpecMonitorPolicy::WhileConverting,
            mute: false,
            pitch_shift_semitones: 0.0,
            absolute_pitch: true,
            estimate_energy: false,
            auto_encode_style: false,
            expansion_rate: 0.1,
            n_buffer_spec: 400,
            len_spec: 20,
            len_content: 100,
            len_style_encoder: 200,
            len_f0n_predictor: 80,
            len_proc: 30,
            fade_len: 352,
            substitute_all_spec: true,
            substitute_all_content: true,
            substitute_all_f0n: false,
            stage_fault_budget: 8,
            record_every_secs: 0.0,
            record_dir: None,
            seed: 2141,
        }
    }
}

impl EngineConfig {
    /// Output samples per block at the device rate.
    pub fn block_size(&self) -> usize {
        self.block_roll * self.sample_rate_out as usize / 50
    }

    /// Samples per block at the 16 kHz analysis rate.
    pub fn block_size_16k(&self) -> usize {
        self.block_roll * SPEC_HOP
    }

    /// Waveform samples the spectral stage consumes per cycle.
    pub fn len_w2m(&self) -> usize {
        self.len_spec * 160
    }

    /// Waveform samples the content encoder consumes per cycle.
    pub fn len_embedder_input(&self) -> usize {
        self.len_content * SPEC_HOP + 80
    }

    /// Content frames the encoder yields for [`len_embedder_input`] samples.
    ///
    /// [`len_embedder_input`]: Self::len_embedder_input
    pub fn len_embedder_output(&self) -> usize {
        (self.len_embedder_input() - 80) / SPEC_HOP
    }

    /// Columns advanced per cycle in the spectrogram/pitch/energy rings.
    pub fn roll_spec(&self) -> usize {
        self.block_roll * 2
    }

    /// Capacity of the device-rate waveform rings.
    pub fn wav_ring_len(&self) -> usize {
        (self.sec_wav_buffer * self.sample_rate_out as f32) as usize
    }

    /// Capacity of the 16 kHz waveform ring.
    pub fn wav16_ring_len(&self) -> usize {
        (self.sec_wav_buffer * SR_PROC as f32) as usize
    }

    /// Capacity of the content embedding ring, in frames.
    pub fn content_ring_len(&self) -> usize {
        self.n_buffer_spec / 2
    }

    /// Wall-clock span of one block. A cycle that takes longer overruns.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size() as f64 / self.sample_rate_out as f64)
    }

    /// Clamp interdependent window lengths and reject unusable geometry.
    pub fn validated(mut self) -> Result<Self> {
        if self.sample_rate_out < 8_000 {
            return Err(VoxmorphError::Config(format!(
                "sample_rate_out {} is below 8 kHz",
                self.sample_rate_out
            )));
        }
        if self.block_roll == 0 {
            return Err(VoxmorphError::Config("block_roll must be at least 1".into()));
        }
        if self.n_buffer_spec < self.roll_spec() {
            return Err(VoxmorphError::Config(format!(
                "n_buffer_spec {} cannot hold one roll of {} columns",
                self.n_buffer_spec,
                self.roll_spec()
            )));
        }

        self.mic_gain_db = self.mic_gain_db.clamp(-20.0, 20.0);
        self.side_gain_db = self.side_gain_db.clamp(-20.0, 20.0);
        self.pitch_shift_semitones = self.pitch_shift_semitones.clamp(-18.0, 18.0);
        self.expansion_rate = self.expansion_rate.clamp(0.0, 1.0);
        self.stage_fault_budget = self.stage_fault_budget.max(1);

        // The waveform rings must hold at least one block.
        let block_secs = self.block_size() as f32 / self.sample_rate_out as f32;
        self.sec_wav_buffer = self.sec_wav_buffer.max(block_secs);

        // Each window must cover at least one block advance and fit in its
        // ring. Frame counts: one block spans `2 * block_roll` spectrogram
        // frames and `block_roll` content frames.
        let min_spec_frames = 2 * self.block_roll;
        self.len_proc = self
            .len_proc
            .min((self.sec_wav_buffer / 0.02) as usize)
            .min(self.content_ring_len())
            .max(min_spec_frames);
        self.len_spec = self.len_spec.min(self.n_buffer_spec).max(min_spec_frames);
        self.len_content = self
            .len_content
            .min(self.wav16_ring_len() / SPEC_HOP)
            .min(self.content_ring_len())
            .max(self.block_roll);
        self.len_style_encoder = self.len_style_encoder.min(self.n_buffer_spec).max(1);
        self.len_f0n_predictor = self
            .len_f0n_predictor
            .min(self.content_ring_len())
            .max(self.block_roll);

        if self.fade_len >= self.block_size() {
            return Err(VoxmorphError::Config(format!(
                "fade_len {} must be smaller than the block size {}",
                self.fade_len,
                self.block_size()
            )));
        }
        if self.record_every_secs > 0.0 && self.record_dir.is_none() {
            return Err(VoxmorphError::Config(
                "record_every_secs is set but record_dir is not".into(),
            ));
        }
        Ok(self)
    }

    /// Apply a patch and re-validate. The original config is untouched, so a
    /// rejected patch leaves the running configuration in place.
    pub fn apply(&self, patch: &ConfigPatch) -> Result<EngineConfig> {
        let mut next = self.clone();
        macro_rules! take {
            ($($field:ident),+ $(,)?) => {
                $(if let Some(v) = &patch.$field { next.$field = v.clone(); })+
            };
        }
        take!(
            input_device,
            output_device,
            sample_rate_out,
            block_roll,
            sec_wav_buffer,
            mic_gain_db,
            side_gain_db,
            gate_threshold_dbfs,
            keep_voiced,
            drain_unvoiced,
            mode,
            monitor_input,
            monitor_output,
            mute,
            pitch_shift_semitones,
            absolute_pitch,
            estimate_energy,
            auto_encode_style,
            expansion_rate,
            n_buffer_spec,
            len_spec,
            len_content,
            len_style_encoder,
            len_f0n_predictor,
            len_proc,
            fade_len,
            substitute_all_spec,
            substitute_all_content,
            substitute_all_f0n,
            stage_fault_budget,
            record_every_secs,
            seed,
        );
        if let Some(dir) = &patch.record_dir {
            next.record_dir = Some(dir.clone());
        }
        next.validated()
    }
}

/// Partial update of an [`EngineConfig`]. `None` fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub input_device: Option<Option<String>>,
    pub output_device: Option<Option<String>>,
    pub sample_rate_out: Option<u32>,
    pub block_roll: Option<usize>,
    pub sec_wav_buffer: Option<f32>,
    pub mic_gain_db: Option<f32>,
    pub side_gain_db: Option<f32>,
    pub gate_threshold_dbfs: Option<f32>,
    pub keep_voiced: Option<usize>,
    pub drain_unvoiced: Option<bool>,
    pub mode: Option<ConversionMode>,
    pub monitor_input: Option<SpecMonitorPolicy>,
    pub monitor_output: Option<SpecMonitorPolicy>,
    pub mute: Option<bool>,
    pub pitch_shift_semitones: Option<f32>,
    pub absolute_pitch: Option<bool>,
    pub estimate_energy: Option<bool>,
    pub auto_encode_style: Option<bool>,
    pub expansion_rate: Option<f32>,
    pub n_buffer_spec: Option<usize>,
    pub len_spec: Option<usize>,
    pub len_content: Option<usize>,
    pub len_style_encoder: Option<usize>,
    pub len_f0n_predictor: Option<usize>,
    pub len_proc: Option<usize>,
    pub fade_len: Option<usize>,
    pub substitute_all_spec: Option<bool>,
    pub substitute_all_content: Option<bool>,
    pub substitute_all_f0n: Option<bool>,
    pub stage_fault_budget: Option<usize>,
    pub record_every_secs: Option<f32>,
    pub record_dir: Option<PathBuf>,
    pub seed: Option<u64>,
}

impl ConfigPatch {
    /// Whether applying this patch changes stream or buffer geometry. Those
    /// fields require a full stop/rebuild/restart; everything else can be
    /// swapped into the running engine between cycles.
    pub fn requires_restart(&self) -> bool {
        self.input_device.is_some()
            || self.output_device.is_some()
            || self.sample_rate_out.is_some()
            || self.block_roll.is_some()
            || self.sec_wav_buffer.is_some()
            || self.n_buffer_spec.is_some()
            || self.len_content.is_some()
            || self.record_every_secs.is_some()
            || self.record_dir.is_some()
            || self.seed.is_some()
    }
}

/// Shared slot holding the active config. Readers clone the inner `Arc` once
/// per cycle; the supervisor swaps in a replacement on hot reconfigure.
pub type ConfigSlot = Arc<RwLock<Arc<EngineConfig>>>;

pub fn config_slot(cfg: EngineConfig) -> ConfigSlot {
    Arc::new(RwLock::new(Arc::new(cfg)))
}

/// Control values the audio callbacks read every block. Plain atomics so the
/// real-time threads never take a lock.
#[derive(Debug)]
pub struct SharedControls {
    mic_gain_db: AtomicU32,
    side_gain_db: AtomicU32,
    gate_threshold_dbfs: AtomicU32,
    keep_voiced: AtomicUsize,
    mute: AtomicBool,
    drain_unvoiced: AtomicBool,
    /// Set once the render side has emitted its first block. Until then the
    /// gate reports every block unvoiced so startup noise never converts.
    engine_live: AtomicBool,
    /// Blocks captured / emitted since the streams opened.
    head_in: AtomicU64,
    head_out: AtomicU64,
}

impl SharedControls {
    pub fn new(cfg: &EngineConfig) -> Arc<Self> {
        let ctrl = Self {
            mic_gain_db: AtomicU32::new(cfg.mic_gain_db.to_bits()),
            side_gain_db: AtomicU32::new(cfg.side_gain_db.to_bits()),
            gate_threshold_dbfs: AtomicU32::new(cfg.gate_threshold_dbfs.to_bits()),
            keep_voiced: AtomicUsize::new(cfg.keep_voiced),
            mute: AtomicBool::new(cfg.mute),
            drain_unvoiced: AtomicBool::new(cfg.drain_unvoiced),
            engine_live: AtomicBool::new(false),
            head_in: AtomicU64::new(0),
            head_out: AtomicU64::new(0),
        };
        Arc::new(ctrl)
    }

    /// Re-seed every control from a freshly validated config.
    pub fn sync(&self, cfg: &EngineConfig) {
        self.mic_gain_db
            .store(cfg.mic_gain_db.to_bits(), Ordering::Relaxed);
        self.side_gain_db
            .store(cfg.side_gain_db.to_bits(), Ordering::Relaxed);
        self.gate_threshold_dbfs
            .store(cfg.gate_threshold_dbfs.to_bits(), Ordering::Relaxed);
        self.keep_voiced.store(cfg.keep_voiced, Ordering::Relaxed);
        self.mute.store(cfg.mute, Ordering::Relaxed);
        self.drain_unvoiced
            .store(cfg.drain_unvoiced, Ordering::Relaxed);
    }

    pub fn mic_gain_db(&self) -> f32 {
        f32::from_bits(self.mic_gain_db.load(Ordering::Relaxed))
    }

    pub fn side_gain_db(&self) -> f32 {
        f32::from_bits(self.side_gain_db.load(Ordering::Relaxed))
    }

    pub fn gate_threshold_dbfs(&self) -> f32 {
        f32::from_bits(self.gate_threshold_dbfs.load(Ordering::Relaxed))
    }

    pub fn keep_voiced(&self) -> usize {
        self.keep_voiced.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Relaxed);
    }

    pub fn drain_unvoiced(&self) -> bool {
        self.drain_unvoiced.load(Ordering::Relaxed)
    }

    pub fn engine_live(&self) -> bool {
        self.engine_live.load(Ordering::Acquire)
    }

    pub fn mark_engine_live(&self) {
        self.engine_live.store(true, Ordering::Release);
    }

    pub fn reset_engine_live(&self) {
        self.engine_live.store(false, Ordering::Release);
    }

    pub fn bump_head_in(&self) -> u64 {
        self.head_in.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn bump_head_out(&self) -> u64 {
        self.head_out.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn head_in(&self) -> u64 {
        self.head_in.load(Ordering::Relaxed)
    }

    pub fn head_out(&self) -> u64 {
        self.head_out.load(Ordering::Relaxed)
    }
}
