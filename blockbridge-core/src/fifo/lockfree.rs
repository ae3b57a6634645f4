//! Wait-free FIFO for exactly one writer thread and one reader thread.
//!
//! After copying elements in, the writer publishes its cursor with `Release`; the
//! reader loads it with `Acquire` before trusting the fill count, so it never sees a
//! count that covers slots whose contents are not yet visible. Free space on the
//! writer side is derived symmetrically from the reader's published cursor.
//!
//! No locks, no allocation, no syscalls: `write` and `read` are safe to call from an
//! audio callback.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{fill_between, RingBuffer, SharedFifo, Side};
use crate::error::{FifoError, Result};

/// Single-producer/single-consumer ring buffer with acquire/release cursors.
///
/// Both sides take `&self`, so the buffer can live in an `Arc` (or inside a
/// [`DoubleBuffer`](crate::dblbuf::DoubleBuffer)). A second concurrent writer or
/// reader is detected and rejected with `FifoError::Config` rather than racing.
pub struct LockFreeRingBuffer<T> {
    slots: Box<[UnsafeCell<T>]>,
    /// Published write cursor. Stored only by the writer.
    write: AtomicUsize,
    /// Published read cursor. Stored only by the reader.
    read: AtomicUsize,
    writer_busy: AtomicBool,
    reader_busy: AtomicBool,
}

// SAFETY: a slot is only touched by the side that currently owns it: the writer owns
// `[write, read - 1)`, the reader owns `[read, write)`. Ownership moves with the
// Release stores / Acquire loads of the cursors, and the busy flags keep each side
// to one thread at a time.
unsafe impl<T: Send> Sync for LockFreeRingBuffer<T> {}

impl<T: Clone> LockFreeRingBuffer<T> {
    /// Create a buffer whose slots start out as `T::default()`.
    pub fn new(max_fill_count: usize) -> Result<Self>
    where
        T: Default,
    {
        Self::with_fill(max_fill_count, T::default())
    }

    /// Create a buffer holding at most `max_fill_count` elements, unused slots being
    /// copies of `fill`.
    pub fn with_fill(max_fill_count: usize, fill: T) -> Result<Self> {
        RingBuffer::with_fill(max_fill_count, fill).map(Self::from)
    }

    /// Append all of `data`. Writer thread only.
    ///
    /// # Errors
    /// `FifoError::CapacityExceeded` if `data` does not fit into the space the reader
    /// has released so far.
    pub fn write(&self, data: &[T]) -> Result<()> {
        let _claim = Claim::take(&self.writer_busy, Side::Writer)?;
        let len = self.slots.len();
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let available = len - 1 - fill_between(write, read, len);
        if data.len() > available {
            return Err(FifoError::CapacityExceeded {
                requested: data.len(),
                available,
            });
        }

        let mut idx = write;
        for x in data {
            // SAFETY: `idx` lies in the writer-owned region checked above.
            unsafe { *self.slots[idx].get() = x.clone() };
            idx += 1;
            if idx == len {
                idx = 0;
            }
        }
        self.write.store(idx, Ordering::Release);
        Ok(())
    }

    /// Fill all of `out` with the oldest elements. Reader thread only.
    ///
    /// # Errors
    /// `FifoError::InsufficientData` if the writer has not yet published enough.
    pub fn read(&self, out: &mut [T]) -> Result<()> {
        let _claim = Claim::take(&self.reader_busy, Side::Reader)?;
        let len = self.slots.len();
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        let available = fill_between(write, read, len);
        if out.len() > available {
            return Err(FifoError::InsufficientData {
                requested: out.len(),
                available,
            });
        }

        let mut idx = read;
        for x in out.iter_mut() {
            // SAFETY: `idx` lies in the reader-owned region checked above.
            *x = unsafe { (*self.slots[idx].get()).clone() };
            idx += 1;
            if idx == len {
                idx = 0;
            }
        }
        self.read.store(idx, Ordering::Release);
        Ok(())
    }
}

impl<T> LockFreeRingBuffer<T> {
    /// Readable elements. Reader thread only for an exact answer.
    pub fn fill_count(&self) -> usize {
        // Our own cursor needs no synchronisation; the writer's must be acquired.
        fill_between(
            self.write.load(Ordering::Acquire),
            self.read.load(Ordering::Relaxed),
            self.slots.len(),
        )
    }

    /// Writable slots. Writer thread only for an exact answer.
    pub fn available_space(&self) -> usize {
        self.max_fill_count()
            - fill_between(
                self.write.load(Ordering::Relaxed),
                self.read.load(Ordering::Acquire),
                self.slots.len(),
            )
    }

    pub fn max_fill_count(&self) -> usize {
        self.slots.len() - 1
    }
}

impl<T> From<RingBuffer<T>> for LockFreeRingBuffer<T> {
    /// Publish an existing ring buffer's contents and cursors.
    fn from(ring: RingBuffer<T>) -> Self {
        let (buf, write, read) = ring.into_parts();
        let slots: Vec<UnsafeCell<T>> = buf
            .into_vec()
            .into_iter()
            .map(UnsafeCell::new)
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            write: AtomicUsize::new(write),
            read: AtomicUsize::new(read),
            writer_busy: AtomicBool::new(false),
            reader_busy: AtomicBool::new(false),
        }
    }
}

impl<T: Clone + Send> SharedFifo<T> for LockFreeRingBuffer<T> {
    fn with_fill(max_fill_count: usize, fill: T) -> Result<Self> {
        LockFreeRingBuffer::with_fill(max_fill_count, fill)
    }

    fn write(&self, data: &[T]) -> Result<()> {
        LockFreeRingBuffer::write(self, data)
    }

    fn read(&self, out: &mut [T]) -> Result<()> {
        LockFreeRingBuffer::read(self, out)
    }

    fn fill_count(&self) -> usize {
        LockFreeRingBuffer::fill_count(self)
    }

    fn available_space(&self) -> usize {
        LockFreeRingBuffer::available_space(self)
    }

    fn max_fill_count(&self) -> usize {
        LockFreeRingBuffer::max_fill_count(self)
    }
}

impl<T> std::fmt::Debug for LockFreeRingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeRingBuffer")
            .field("max_fill_count", &self.max_fill_count())
            .field("write", &self.write.load(Ordering::Relaxed))
            .field("read", &self.read.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Exclusive use of one side for the duration of a call.
struct Claim<'a>(&'a AtomicBool);

impl<'a> Claim<'a> {
    fn take(flag: &'a AtomicBool, side: Side) -> Result<Self> {
        if flag.swap(true, Ordering::Acquire) {
            return Err(FifoError::Config(format!(
                "concurrent {side} on a single-{side} FIFO"
            )));
        }
        Ok(Self(flag))
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_on_one_thread() {
        let fifo = LockFreeRingBuffer::new(4).unwrap();
        fifo.write(&[1u32, 2, 3]).unwrap();
        assert_eq!(fifo.fill_count(), 3);
        assert_eq!(fifo.available_space(), 1);

        let mut out = [0u32; 2];
        fifo.read(&mut out).unwrap();
        assert_eq!(out, [1, 2]);

        fifo.write(&[4, 5, 6]).unwrap();
        let mut out = [0u32; 4];
        fifo.read(&mut out).unwrap();
        assert_eq!(out, [3, 4, 5, 6]);
        assert_eq!(fifo.fill_count(), 0);
    }

    #[test]
    fn capacity_errors_match_plain_ring() {
        let fifo = LockFreeRingBuffer::<f32>::new(2).unwrap();
        assert!(matches!(
            fifo.write(&[0.0; 3]),
            Err(FifoError::CapacityExceeded {
                requested: 3,
                available: 2
            })
        ));
        let mut out = [0.0f32; 1];
        assert!(matches!(
            fifo.read(&mut out),
            Err(FifoError::InsufficientData {
                requested: 1,
                available: 0
            })
        ));
    }

    #[test]
    fn second_writer_is_rejected() {
        let fifo = LockFreeRingBuffer::<i16>::new(8).unwrap();
        // Simulate a writer that is mid-call on another thread.
        fifo.writer_busy.store(true, Ordering::SeqCst);
        assert!(matches!(fifo.write(&[1]), Err(FifoError::Config(_))));
        fifo.writer_busy.store(false, Ordering::SeqCst);
        fifo.write(&[1]).unwrap();
    }

    #[test]
    fn conversion_keeps_ring_contents() {
        let mut ring = RingBuffer::new(3).unwrap();
        ring.write(&[9u8, 8]).unwrap();
        let fifo = LockFreeRingBuffer::from(ring);
        assert_eq!(fifo.fill_count(), 2);
        let mut out = [0u8; 2];
        fifo.read(&mut out).unwrap();
        assert_eq!(out, [9, 8]);
    }
}
