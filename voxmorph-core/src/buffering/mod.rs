//! Queues and rolling windows between the audio callbacks and the engine.
//!
//! Two hand-offs cross thread boundaries:
//!
//! * capture → render: a bounded channel of [`TaggedBlock`]s. The capture
//!   side never blocks; when the render side falls behind and the channel
//!   fills, the newest block is dropped and counted.
//! * caller → capture: a lock-free SPSC sample ring for side-channel audio
//!   that gets mixed into the microphone signal. Pushes need not be aligned
//!   to block boundaries.

pub mod block;
pub mod ring;

pub use block::{AudioBlock, TaggedBlock};
pub use ring::RingBuffer;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use ringbuf::{traits::Split, HeapCons, HeapProd, HeapRb};

/// Blocks the capture→render channel holds before dropping. At the default
/// geometry (140 ms blocks) this is several minutes of backlog.
pub const BLOCK_QUEUE_CAPACITY: usize = 2048;

/// Samples the side-channel ring holds (about 5 s at 48 kHz).
pub const SIDE_RING_CAPACITY: usize = 1 << 18;

pub type BlockSender = Sender<TaggedBlock>;
pub type BlockReceiver = Receiver<TaggedBlock>;

pub type SideProducer = HeapProd<f32>;
pub type SideConsumer = HeapCons<f32>;

pub fn create_block_queue() -> (BlockSender, BlockReceiver) {
    bounded(BLOCK_QUEUE_CAPACITY)
}

pub fn create_side_ring() -> (SideProducer, SideConsumer) {
    HeapRb::<f32>::new(SIDE_RING_CAPACITY).split()
}

/// Non-blocking enqueue. Returns `false` when the queue is full and the
/// block was dropped.
pub fn offer_block(tx: &BlockSender, block: TaggedBlock) -> bool {
    tx.try_send(block).is_ok()
}

/// Pop the next block for the render side.
///
/// With `drain_unvoiced`, queued silence is discarded while newer blocks are
/// waiting, so playback snaps back to real time after a stall instead of
/// replaying the backlog. The count of skipped blocks is returned alongside.
pub fn next_block(rx: &BlockReceiver, drain_unvoiced: bool) -> Option<(TaggedBlock, usize)> {
    let mut blk = match rx.try_recv() {
        Ok(b) => b,
        Err(TryRecvError::Empty | TryRecvError::Disconnected) => return None,
    };
    let mut drained = 0;
    if drain_unvoiced {
        while !blk.voiced {
            match rx.try_recv() {
                Ok(next) => {
                    drained += 1;
                    blk = next;
                }
                Err(_) => break,
            }
        }
    }
    Some((blk, drained))
}
