//! Overlap-add stitching of decoded blocks.
//!
//! Each convert cycle decodes slightly more audio than one block. The kernel
//! windows the decoded tail with a raised-sine envelope; the part past the
//! block boundary is held back as the falling tail and added under the head
//! of the next cycle's output. Because the rising and falling edges sum to
//! one, a steady signal passes through the seam unchanged.

/// Windowing kernel over `block_size + fade_len` samples: a sin² rise of
/// `fade_len`, a unity plateau, and the complementary cos² fall.
#[derive(Debug, Clone)]
pub struct CrossFadeKernel {
    window: Vec<f32>,
    block_size: usize,
    fade_len: usize,
}

impl CrossFadeKernel {
    pub fn new(block_size: usize, fade_len: usize) -> Self {
        debug_assert!(fade_len < block_size);
        let mut window = vec![1.0f32; block_size + fade_len];
        for i in 0..fade_len {
            // Midpoint sampling keeps the edges strictly inside (0, 1).
            let t = std::f32::consts::FRAC_PI_2 * (i as f32 + 0.5) / fade_len as f32;
            let rise = t.sin() * t.sin();
            window[i] = rise;
            window[block_size + fade_len - 1 - i] = rise;
        }
        Self {
            window,
            block_size,
            fade_len,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn fade_len(&self) -> usize {
        self.fade_len
    }

    /// Samples of decoded audio one [`apply`] call consumes.
    ///
    /// [`apply`]: Self::apply
    pub fn input_len(&self) -> usize {
        self.block_size + self.fade_len
    }

    /// Window `decoded` (exactly [`input_len`] samples), blend in the
    /// previous falling tail, and emit exactly one block. The new falling
    /// tail replaces the old one in `state`.
    ///
    /// [`input_len`]: Self::input_len
    pub fn apply(&self, decoded: &[f32], state: &mut CrossFadeState) -> Vec<f32> {
        debug_assert_eq!(decoded.len(), self.input_len());
        let mut out = Vec::with_capacity(self.block_size);
        out.extend(
            decoded[..self.block_size]
                .iter()
                .zip(&self.window)
                .map(|(s, w)| s * w),
        );
        for (o, t) in out.iter_mut().zip(&state.tail) {
            *o += t;
        }
        state.tail.clear();
        state.tail.extend(
            decoded[self.block_size..]
                .iter()
                .zip(&self.window[self.block_size..])
                .map(|(s, w)| s * w),
        );
        out
    }

    /// Reset the carried tail from raw (unwindowed) audio. Used by the
    /// bypass path so a later convert cycle blends against what was actually
    /// played, not against stale decoder output.
    pub fn refresh_tail(&self, raw_block: &[f32], state: &mut CrossFadeState) {
        debug_assert!(raw_block.len() >= self.fade_len);
        let tail = &raw_block[raw_block.len() - self.fade_len..];
        state.tail.clear();
        state.tail.extend(
            tail.iter()
                .zip(&self.window[self.block_size..])
                .map(|(s, w)| s * w),
        );
    }
}

/// The falling tail carried between cycles.
#[derive(Debug, Clone, Default)]
pub struct CrossFadeState {
    tail: Vec<f32>,
}

impl CrossFadeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.tail.clear();
    }

    #[cfg(test)]
    pub(crate) fn tail(&self) -> &[f32] {
        &self.tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn edges_are_complementary() {
        let kernel = CrossFadeKernel::new(64, 16);
        let w = &kernel.window;
        for i in 0..16 {
            // rise[i] + fall[i] must sum to one for seamless overlap-add.
            assert_relative_eq!(w[i] + w[64 + i], 1.0, epsilon = 1e-6);
        }
        // Plateau is unity.
        for &v in &w[16..64] {
            assert_eq!(v, 1.0);
        }
    }

    #[test]
    fn emits_exactly_one_block() {
        let kernel = CrossFadeKernel::new(100, 20);
        let mut state = CrossFadeState::new();
        let out = kernel.apply(&vec![0.5; kernel.input_len()], &mut state);
        assert_eq!(out.len(), 100);
        assert_eq!(state.tail().len(), 20);
    }

    #[test]
    fn steady_signal_passes_seam_unchanged() {
        let kernel = CrossFadeKernel::new(128, 32);
        let mut state = CrossFadeState::new();
        let dc = vec![1.0f32; kernel.input_len()];
        let first = kernel.apply(&dc, &mut state);
        let second = kernel.apply(&dc, &mut state);
        // After the first block's rise, every sample is the sum of a rise
        // and the previous fall, i.e. exactly the input level.
        for &s in &first[32..] {
            assert_relative_eq!(s, 1.0, epsilon = 1e-5);
        }
        for &s in &second {
            assert_relative_eq!(s, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn tail_carries_into_next_head() {
        let kernel = CrossFadeKernel::new(10, 4);
        let mut state = CrossFadeState::new();
        kernel.apply(&vec![1.0; 14], &mut state);
        let tail: Vec<f32> = state.tail().to_vec();
        let out = kernel.apply(&vec![0.0; 14], &mut state);
        for i in 0..4 {
            assert_relative_eq!(out[i], tail[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn refresh_tail_matches_applied_fall() {
        let kernel = CrossFadeKernel::new(16, 4);
        let mut via_apply = CrossFadeState::new();
        let signal = vec![0.7f32; 20];
        kernel.apply(&signal, &mut via_apply);

        let mut via_refresh = CrossFadeState::new();
        kernel.refresh_tail(&vec![0.7f32; 16], &mut via_refresh);
        for (a, b) in via_apply.tail().iter().zip(via_refresh.tail()) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_fade_is_passthrough() {
        let kernel = CrossFadeKernel::new(8, 0);
        let mut state = CrossFadeState::new();
        let out = kernel.apply(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &mut state);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert!(state.tail().is_empty());
    }
}
