//! Stream lifecycle management.
//!
//! [`StreamSupervisor`] is the caller-facing handle: it validates configs,
//! warms the backend up, owns the running/stopped state, and applies live
//! reconfiguration. The cpal streams themselves live on a dedicated blocking
//! thread because they are not `Send`; the supervisor talks to that thread
//! through atomics and a one-shot open-confirmation channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::Producer;
use serde::Serialize;
use tracing::{info, warn};

use crate::audio::{DuplexAudioLoop, DuplexParams};
use crate::buffering::{create_side_ring, SideProducer};
use crate::config::{
    config_slot, ConfigPatch, ConfigSlot, ConversionMode, EngineConfig, SharedControls,
};
use crate::engine::{ConversionEngine, EngineMetrics, MetricsSnapshot};
use crate::error::{Result, VoxmorphError};
use crate::record::BlockRecorder;
use crate::stages::BackendHandle;
use crate::style::{StyleHandle, StyleVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorStatus {
    Idle,
    Running,
    /// Running, but the stage fault budget is exhausted and every cycle is
    /// falling back to bypass. A restart (or reconfigure) clears it.
    Stalled,
}

pub struct StreamSupervisor {
    cfg_slot: ConfigSlot,
    style: StyleHandle,
    backend: BackendHandle,
    metrics: Arc<EngineMetrics>,
    controls: Arc<SharedControls>,
    running: Arc<AtomicBool>,
    side_prod: Mutex<Option<SideProducer>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamSupervisor {
    pub fn new(cfg: EngineConfig, backend: BackendHandle) -> Result<Self> {
        let cfg = cfg.validated()?;
        let controls = SharedControls::new(&cfg);
        Ok(Self {
            cfg_slot: config_slot(cfg),
            style: StyleHandle::default(),
            backend,
            metrics: Arc::new(EngineMetrics::default()),
            controls,
            running: Arc::new(AtomicBool::new(false)),
            side_prod: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Run every model graph once so the first voiced block does not pay
    /// session initialization. Call before `start`.
    pub fn warm_up(&self) -> Result<()> {
        self.backend.0.lock().warm_up()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SupervisorStatus {
        if !self.is_running() {
            SupervisorStatus::Idle
        } else if self.metrics.stalled.load(Ordering::Relaxed) {
            SupervisorStatus::Stalled
        } else {
            SupervisorStatus::Running
        }
    }

    /// Build a fresh engine and open both streams. Returns once the device
    /// side has confirmed the open, so device faults surface here.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(VoxmorphError::AlreadyRunning);
        }

        let cfg = self.cfg_slot.read().clone();
        self.metrics.reset();
        self.controls.reset_engine_live();
        self.controls.sync(&cfg);

        let engine = match ConversionEngine::new(
            self.cfg_slot.clone(),
            self.style.clone(),
            self.backend.clone(),
            self.metrics.clone(),
        ) {
            Ok(engine) => engine,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let recorder = match self.build_recorder(&cfg) {
            Ok(rec) => rec,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (side_tx, side_rx) = create_side_ring();
        *self.side_prod.lock() = Some(side_tx);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let running = Arc::clone(&self.running);
        let params = DuplexParams {
            config: cfg,
            engine,
            controls: Arc::clone(&self.controls),
            metrics: Arc::clone(&self.metrics),
            side: side_rx,
            recorder,
            running: Arc::clone(&self.running),
        };

        let handle = tokio::task::spawn_blocking(move || {
            let duplex = match DuplexAudioLoop::open(params) {
                Ok(duplex) => {
                    let _ = open_tx.send(Ok(duplex.sample_rate));
                    duplex
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };
            // Streams are callback-driven; this thread just keeps them
            // alive until stop.
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            duplex.stop();
            drop(duplex);
        });
        *self.worker.lock() = Some(handle);

        match open_rx.recv() {
            Ok(Ok(sample_rate)) => {
                info!(sample_rate, "duplex streams running");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(anyhow::anyhow!("audio task died before confirming stream open").into())
            }
        }
    }

    /// Stop both streams and wait for the audio thread to release its
    /// devices. Queued blocks are discarded with the loop.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(VoxmorphError::NotRunning);
        }
        *self.side_prod.lock() = None;
        self.controls.reset_engine_live();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("audio worker ended abnormally during stop");
            }
        }
        info!("duplex streams stopped");
        Ok(())
    }

    /// Apply a config patch.
    ///
    /// Validation happens first; a rejected patch changes nothing and the
    /// streams keep running on the previous config. Hot fields swap into
    /// the live engine between cycles. Geometry fields stop both streams,
    /// rebuild the engine (fresh kernel, fresh queue) and start again.
    pub async fn reconfigure(&self, patch: ConfigPatch) -> Result<()> {
        let next = self.cfg_slot.read().apply(&patch)?;
        let restart = patch.requires_restart() && self.is_running();
        if restart {
            self.stop().await?;
        }
        self.controls.sync(&next);
        *self.cfg_slot.write() = Arc::new(next);
        if restart {
            self.start().await?;
        }
        Ok(())
    }

    fn swap_config(&self, mutate: impl FnOnce(&mut EngineConfig)) -> Result<()> {
        let mut next = (**self.cfg_slot.read()).clone();
        mutate(&mut next);
        let next = next.validated()?;
        self.controls.sync(&next);
        *self.cfg_slot.write() = Arc::new(next);
        Ok(())
    }

    pub fn set_mode(&self, mode: ConversionMode) -> Result<()> {
        self.swap_config(|cfg| cfg.mode = mode)
    }

    pub fn set_pitch_shift(&self, semitones: f32) -> Result<()> {
        self.swap_config(|cfg| cfg.pitch_shift_semitones = semitones)
    }

    pub fn set_mute(&self, mute: bool) {
        self.controls.set_mute(mute);
    }

    /// Replace the target style. The next cycle picks it up whole.
    pub fn set_style(&self, style: StyleVector) {
        self.style.replace(style);
    }

    /// Feed side-channel audio to be mixed into the capture stream.
    /// Returns how many samples were accepted; zero when not running.
    pub fn push_side_audio(&self, samples: &[f32]) -> usize {
        match self.side_prod.lock().as_mut() {
            Some(prod) => prod.push_slice(samples),
            None => 0,
        }
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.cfg_slot.read().clone()
    }

    pub fn style_handle(&self) -> &StyleHandle {
        &self.style
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Blocks captured and emitted since the streams opened.
    pub fn heads(&self) -> (u64, u64) {
        (self.controls.head_in(), self.controls.head_out())
    }

    fn build_recorder(&self, cfg: &EngineConfig) -> Result<Option<BlockRecorder>> {
        if cfg.record_every_secs <= 0.0 {
            return Ok(None);
        }
        let dir = cfg.record_dir.clone().ok_or_else(|| {
            VoxmorphError::Config("record_every_secs is set but record_dir is not".into())
        })?;
        Ok(Some(BlockRecorder::new(
            dir,
            cfg.sample_rate_out,
            cfg.record_every_secs,
        )?))
    }
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpecMonitorPolicy;
    use crate::stages::stub::StubBackend;

    fn supervisor() -> StreamSupervisor {
        StreamSupervisor::new(
            EngineConfig {
                sample_rate_out: 16_000,
                ..Default::default()
            },
            BackendHandle::new(StubBackend::new(2141)),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let err = StreamSupervisor::new(
            EngineConfig {
                sample_rate_out: 100,
                ..Default::default()
            },
            BackendHandle::new(StubBackend::new(0)),
        )
        .unwrap_err();
        assert!(matches!(err, VoxmorphError::Config(_)));
    }

    #[tokio::test]
    async fn stop_without_start_errors() {
        let sup = supervisor();
        assert!(matches!(
            sup.stop().await.unwrap_err(),
            VoxmorphError::NotRunning
        ));
        assert_eq!(sup.status(), SupervisorStatus::Idle);
    }

    #[tokio::test]
    async fn hot_reconfigure_swaps_in_place() {
        let sup = supervisor();
        let patch = ConfigPatch {
            pitch_shift_semitones: Some(5.0),
            monitor_output: Some(SpecMonitorPolicy::Never),
            ..Default::default()
        };
        sup.reconfigure(patch).await.unwrap();
        let cfg = sup.config();
        assert_eq!(cfg.pitch_shift_semitones, 5.0);
        assert_eq!(cfg.monitor_output, SpecMonitorPolicy::Never);
    }

    #[tokio::test]
    async fn rejected_patch_keeps_previous_config() {
        let sup = supervisor();
        let patch = ConfigPatch {
            fade_len: Some(1_000_000),
            ..Default::default()
        };
        assert!(sup.reconfigure(patch).await.is_err());
        assert_eq!(sup.config().fade_len, 352);
    }

    #[test]
    fn side_audio_ignored_when_idle() {
        let sup = supervisor();
        assert_eq!(sup.push_side_audio(&[0.0; 128]), 0);
    }

    #[test]
    fn warm_up_runs_on_stub() {
        supervisor().warm_up().unwrap();
    }

    #[test]
    fn mode_swap_is_hot() {
        let sup = supervisor();
        sup.set_mode(ConversionMode::ForceConvert).unwrap();
        assert_eq!(sup.config().mode, ConversionMode::ForceConvert);
    }
}
