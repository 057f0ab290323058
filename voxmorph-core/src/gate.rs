//! Energy-based voice gate.
//!
//! Runs inside the capture callback, so everything here is allocation-free
//! and branch-cheap. The gate compares the block level in dBFS against a
//! threshold and holds open for `keep_voiced` extra blocks after the level
//! drops, so word endings are not clipped by the bypass path.

/// Block level in dBFS. The epsilon keeps digital silence finite.
pub fn dbfs_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return -160.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    20.0 * (rms + 1e-8).log10()
}

/// Hysteresis gate over per-block dBFS levels.
#[derive(Debug)]
pub struct VoiceGate {
    threshold_dbfs: f32,
    keep_voiced: usize,
    /// Remaining blocks the gate stays open. Loud blocks reload it to
    /// `keep_voiced + 1`; quiet blocks decrement toward zero.
    hold: usize,
    /// Until the render side emits its first block, every block reads as
    /// unvoiced so the pipeline warms up on the bypass path.
    live: bool,
}

impl VoiceGate {
    pub fn new(threshold_dbfs: f32, keep_voiced: usize) -> Self {
        Self {
            threshold_dbfs,
            keep_voiced,
            hold: 0,
            live: false,
        }
    }

    /// Classify one block. Returns `true` when the block should convert.
    pub fn update(&mut self, dbfs: f32) -> bool {
        if !self.live {
            self.hold = 0;
            return false;
        }
        if dbfs > self.threshold_dbfs {
            self.hold = self.keep_voiced + 1;
        } else {
            self.hold = self.hold.saturating_sub(1);
        }
        self.hold > 0
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    pub fn set_threshold(&mut self, threshold_dbfs: f32) {
        self.threshold_dbfs = threshold_dbfs;
    }

    pub fn set_keep_voiced(&mut self, keep_voiced: usize) {
        self.keep_voiced = keep_voiced;
    }

    pub fn reset(&mut self) {
        self.hold = 0;
        self.live = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn live_gate(threshold: f32, keep: usize) -> VoiceGate {
        let mut g = VoiceGate::new(threshold, keep);
        g.set_live(true);
        g
    }

    #[test]
    fn dbfs_of_full_scale_sine() {
        let sine: Vec<f32> = (0..4800)
            .map(|i| (i as f32 * 0.1).sin())
            .collect();
        // RMS of a sine is 1/sqrt(2), about -3 dBFS.
        assert_relative_eq!(dbfs_level(&sine), -3.01, epsilon = 0.1);
    }

    #[test]
    fn dbfs_of_silence_is_floor() {
        assert!(dbfs_level(&[0.0; 256]) < -150.0);
    }

    #[test]
    fn holds_open_for_keep_voiced_blocks() {
        let mut gate = live_gate(-40.0, 2);
        assert!(gate.update(-10.0));
        // Exactly keep_voiced quiet blocks stay voiced, then it closes.
        assert!(gate.update(-80.0));
        assert!(gate.update(-80.0));
        assert!(!gate.update(-80.0));
    }

    #[test]
    fn silence_voice_silence_script() {
        let mut gate = live_gate(-40.0, 1);
        for _ in 0..50 {
            assert!(!gate.update(-90.0));
        }
        for _ in 0..5 {
            assert!(gate.update(-12.0));
        }
        // One held block into the trailing silence, then bypass.
        assert!(gate.update(-90.0));
        assert!(!gate.update(-90.0));
        assert!(!gate.update(-90.0));
    }

    #[test]
    fn not_live_forces_unvoiced() {
        let mut gate = VoiceGate::new(-40.0, 3);
        assert!(!gate.update(-5.0));
        assert!(!gate.update(-5.0));
        gate.set_live(true);
        assert!(gate.update(-5.0));
    }

    #[test]
    fn reload_on_retrigger() {
        let mut gate = live_gate(-40.0, 1);
        assert!(gate.update(-10.0));
        assert!(gate.update(-80.0));
        // A loud block mid-decay reloads the full hold.
        assert!(gate.update(-10.0));
        assert!(gate.update(-80.0));
        assert!(!gate.update(-80.0));
    }
}
