//! Fixed-capacity FIFOs for blocks of audio samples.
//!
//! | Type | Synchronisation | Blocks? |
//! |------|-----------------|---------|
//! | [`RingBuffer`] | none, single actor | never |
//! | [`LockFreeRingBuffer`] | acquire/release cursors, one writer + one reader | never |
//! | [`SynchronizedRingBuffer`] | mutex + two condition variables | when full / empty |
//! | [`DriftingRingBuffer`] | none, tolerates rate drift | never |
//!
//! Every buffer allocates `max_fill_count + 1` slots once at construction; one slot
//! always stays unused so that "full" and "empty" have distinct cursor states.

pub mod drift;
pub mod lockfree;
pub mod ring;
pub mod sync;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FifoError, Result};

pub use drift::{DriftConfig, DriftingRingBuffer, XrunStats};
pub use lockfree::LockFreeRingBuffer;
pub use ring::RingBuffer;
pub use sync::{CondvarPlatform, SynchronizedRingBuffer, WaitPlatform};

/// The two parties of a single-producer/single-consumer FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Reader,
    Writer,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Reader => f.write_str("reader"),
            Side::Writer => f.write_str("writer"),
        }
    }
}

/// A FIFO driven by a single logical actor (`&mut self` on both sides).
pub trait Fifo<T> {
    /// Append all of `data`.
    fn write(&mut self, data: &[T]) -> Result<()>;

    /// Fill all of `out` with the oldest elements.
    fn read(&mut self, out: &mut [T]) -> Result<()>;

    /// Number of elements that can currently be read.
    fn fill_count(&self) -> usize;

    /// Number of elements that can currently be written.
    fn available_space(&self) -> usize;

    /// Capacity fixed at construction.
    fn max_fill_count(&self) -> usize;
}

/// A FIFO shared between exactly one writer thread and one reader thread.
///
/// This is the seam [`DoubleBuffer`](crate::dblbuf::DoubleBuffer) is generic over.
pub trait SharedFifo<T>: Send + Sync + Sized {
    /// Whether `write` waits for space and `read` waits for data instead of failing.
    const BLOCKING: bool = false;

    /// Allocate a FIFO whose unused slots are copies of `fill`.
    fn with_fill(max_fill_count: usize, fill: T) -> Result<Self>;

    /// Append all of `data`. Writer thread only.
    fn write(&self, data: &[T]) -> Result<()>;

    /// Fill all of `out`. Reader thread only.
    fn read(&self, out: &mut [T]) -> Result<()>;

    /// Readable elements as seen from the reader thread.
    fn fill_count(&self) -> usize;

    /// Writable slots as seen from the writer thread.
    fn available_space(&self) -> usize;

    fn max_fill_count(&self) -> usize;

    /// Arm a failure that `side` raises the next time it would have to wait.
    ///
    /// Non-blocking FIFOs never wait, so the default does nothing.
    fn set_error(&self, _side: Side, _error: FifoError) {}
}

/// Storage length for a FIFO holding at most `max_fill_count` elements.
pub(crate) fn storage_len(max_fill_count: usize) -> Result<usize> {
    max_fill_count.checked_add(1).ok_or_else(|| {
        FifoError::Construction(format!(
            "capacity {max_fill_count} overflows the cursor range"
        ))
    })
}

/// Readable elements between cursors in a storage of `len` slots.
#[inline]
pub(crate) fn fill_between(write: usize, read: usize, len: usize) -> usize {
    if write >= read {
        write - read
    } else {
        write + len - read
    }
}
