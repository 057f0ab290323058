//! Fixed-length rolling history windows.
//!
//! Every analysis buffer in the engine (waveforms, spectrogram columns,
//! pitch/energy tracks, content frames) is a fixed-length window where new
//! data enters at the tail and the oldest data falls off the head. The
//! element type is generic: `f32` for sample and track rings, `Vec<f32>` for
//! column rings.

use crate::error::{Result, VoxmorphError};

/// A fixed-length rolling window. Length never changes after construction.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<T>,
}

impl<T: Clone> RingBuffer<T> {
    /// Build a window of `len` elements produced by `seed`. Seeding with
    /// plausible values (faint noise, a nominal pitch) keeps the first few
    /// cycles from processing pure zeros.
    pub fn from_fn(len: usize, seed: impl FnMut(usize) -> T) -> Self {
        Self {
            data: (0..len).map(seed).collect(),
        }
    }

    pub fn filled(len: usize, value: T) -> Self {
        Self {
            data: vec![value; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The newest `n` elements, oldest first.
    pub fn tail(&self, n: usize) -> Result<&[T]> {
        if n > self.data.len() {
            return Err(VoxmorphError::BufferContract(format!(
                "tail of {} requested from ring of {}",
                n,
                self.data.len()
            )));
        }
        Ok(&self.data[self.data.len() - n..])
    }

    /// Advance the window by `roll_step` and write fresh data at the tail.
    ///
    /// With `substitute_all` the entire chunk overwrites the tail, re-stamping
    /// the overlap with this cycle's values; otherwise only the chunk's last
    /// `roll_step` elements land, leaving earlier history untouched.
    pub fn roll_and_substitute(
        &mut self,
        chunk: &[T],
        roll_step: usize,
        substitute_all: bool,
    ) -> Result<()> {
        let len = self.data.len();
        if roll_step > len {
            return Err(VoxmorphError::BufferContract(format!(
                "roll_step {roll_step} exceeds ring length {len}"
            )));
        }
        if chunk.len() < roll_step {
            return Err(VoxmorphError::BufferContract(format!(
                "chunk of {} cannot cover a roll of {roll_step}",
                chunk.len()
            )));
        }
        let write = if substitute_all { chunk.len() } else { roll_step };
        if write > len {
            return Err(VoxmorphError::BufferContract(format!(
                "chunk of {} cannot substitute {write} of {len} elements",
                chunk.len()
            )));
        }
        self.data.rotate_left(roll_step);
        self.data[len - write..].clone_from_slice(&chunk[chunk.len() - write..]);
        Ok(())
    }

    /// Append a chunk, discarding the same number of oldest elements. Chunks
    /// longer than the window keep only their newest part.
    pub fn push(&mut self, chunk: &[T]) -> Result<()> {
        let len = self.data.len();
        if chunk.len() >= len {
            self.data.clone_from_slice(&chunk[chunk.len() - len..]);
            return Ok(());
        }
        self.roll_and_substitute(chunk, chunk.len(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_ring(len: usize) -> RingBuffer<i32> {
        RingBuffer::from_fn(len, |i| i as i32)
    }

    #[test]
    fn length_never_changes() {
        let mut ring = counting_ring(8);
        ring.push(&[100, 101, 102]).unwrap();
        assert_eq!(ring.len(), 8);
        ring.roll_and_substitute(&[7, 8], 2, false).unwrap();
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn push_preserves_order() {
        let mut ring = counting_ring(5);
        ring.push(&[10, 11]).unwrap();
        assert_eq!(ring.as_slice(), &[2, 3, 4, 10, 11]);
        ring.push(&[12]).unwrap();
        assert_eq!(ring.as_slice(), &[3, 4, 10, 11, 12]);
    }

    #[test]
    fn oversized_push_keeps_newest() {
        let mut ring = counting_ring(3);
        ring.push(&[20, 21, 22, 23, 24]).unwrap();
        assert_eq!(ring.as_slice(), &[22, 23, 24]);
    }

    #[test]
    fn substitute_all_restamps_overlap() {
        let mut ring = counting_ring(6);
        // Roll by 2 but rewrite a 4-element tail.
        ring.roll_and_substitute(&[90, 91, 92, 93], 2, true).unwrap();
        assert_eq!(ring.as_slice(), &[2, 3, 90, 91, 92, 93]);
    }

    #[test]
    fn substitute_step_keeps_overlap() {
        let mut ring = counting_ring(6);
        ring.roll_and_substitute(&[90, 91, 92, 93], 2, false).unwrap();
        // Only the chunk's last two elements land.
        assert_eq!(ring.as_slice(), &[2, 3, 4, 5, 92, 93]);
    }

    #[test]
    fn tail_returns_newest() {
        let mut ring = counting_ring(5);
        ring.push(&[10, 11]).unwrap();
        assert_eq!(ring.tail(3).unwrap(), &[4, 10, 11]);
        assert!(ring.tail(6).is_err());
    }

    #[test]
    fn short_chunk_for_roll_rejected() {
        let mut ring = counting_ring(5);
        let err = ring.roll_and_substitute(&[1], 3, false).unwrap_err();
        assert!(matches!(err, VoxmorphError::BufferContract(_)));
    }

    #[test]
    fn substitute_all_short_chunk_rejected() {
        let mut ring = counting_ring(6);
        // A chunk shorter than the roll would leave rotated stale elements
        // mid-window; rejected regardless of the substitution policy.
        let err = ring.roll_and_substitute(&[90, 91], 4, true).unwrap_err();
        assert!(matches!(err, VoxmorphError::BufferContract(_)));
        assert_eq!(ring.as_slice(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn column_ring_of_vectors() {
        let mut ring: RingBuffer<Vec<f32>> = RingBuffer::filled(4, vec![0.0; 2]);
        ring.push(&[vec![1.0, 1.0], vec![2.0, 2.0]]).unwrap();
        assert_eq!(ring.tail(1).unwrap()[0], vec![2.0, 2.0]);
    }
}
