//! Unsynchronised ring buffer.
//!
//! The correctness baseline for every other FIFO in this crate. It assumes a single
//! logical actor; wrap it (or use [`LockFreeRingBuffer`](super::LockFreeRingBuffer) /
//! [`SynchronizedRingBuffer`](super::SynchronizedRingBuffer)) for cross-thread use.

use super::{fill_between, storage_len, Fifo};
use crate::error::{FifoError, Result};

/// Fixed-capacity circular buffer with independent read and write cursors.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    /// `max_fill_count + 1` slots. The slot just behind `read` is always unused.
    buf: Box<[T]>,
    /// Index of the slot written next.
    write: usize,
    /// Index of the slot read next.
    read: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a ring buffer whose slots start out as `T::default()`.
    pub fn new(max_fill_count: usize) -> Result<Self>
    where
        T: Default,
    {
        Self::with_fill(max_fill_count, T::default())
    }

    /// Create a ring buffer holding at most `max_fill_count` elements, initialising
    /// every slot as a copy of `fill`.
    ///
    /// # Errors
    /// `FifoError::Construction` when `max_fill_count + 1` overflows or the storage
    /// cannot be allocated.
    pub fn with_fill(max_fill_count: usize, fill: T) -> Result<Self> {
        let len = storage_len(max_fill_count)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| {
            FifoError::Construction(format!(
                "not enough memory for a FIFO of {max_fill_count} elements"
            ))
        })?;
        buf.resize(len, fill);
        Ok(Self {
            buf: buf.into_boxed_slice(),
            write: 0,
            read: 0,
        })
    }

    /// Append all of `data`.
    ///
    /// # Errors
    /// `FifoError::CapacityExceeded` if `data` does not fit; nothing is written then.
    pub fn write(&mut self, data: &[T]) -> Result<()> {
        let available = self.available_space();
        if data.len() > available {
            return Err(FifoError::CapacityExceeded {
                requested: data.len(),
                available,
            });
        }
        let len = self.buf.len();
        let first = (len - self.write).min(data.len());
        self.buf[self.write..self.write + first].clone_from_slice(&data[..first]);
        self.buf[..data.len() - first].clone_from_slice(&data[first..]);
        self.write = (self.write + data.len()) % len;
        Ok(())
    }

    /// Move the oldest `out.len()` elements into `out`.
    ///
    /// # Errors
    /// `FifoError::InsufficientData` if fewer elements are stored; nothing is read then.
    pub fn read(&mut self, out: &mut [T]) -> Result<()> {
        let available = self.fill_count();
        if out.len() > available {
            return Err(FifoError::InsufficientData {
                requested: out.len(),
                available,
            });
        }
        let len = self.buf.len();
        let first = (len - self.read).min(out.len());
        let (head, tail) = out.split_at_mut(first);
        head.clone_from_slice(&self.buf[self.read..self.read + first]);
        tail.clone_from_slice(&self.buf[..tail.len()]);
        self.read = (self.read + out.len()) % len;
        Ok(())
    }
}

impl<T> RingBuffer<T> {
    pub fn fill_count(&self) -> usize {
        fill_between(self.write, self.read, self.buf.len())
    }

    pub fn available_space(&self) -> usize {
        self.max_fill_count() - self.fill_count()
    }

    pub fn max_fill_count(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.write == self.read
    }

    /// Drop all stored elements at once. Reader side, or while the reader is idle.
    pub(crate) fn clear(&mut self) {
        self.read = self.write;
    }

    /// Storage and cursors, for FIFOs that add their own synchronisation.
    pub(crate) fn into_parts(self) -> (Box<[T]>, usize, usize) {
        (self.buf, self.write, self.read)
    }
}

impl<T: Clone> Fifo<T> for RingBuffer<T> {
    fn write(&mut self, data: &[T]) -> Result<()> {
        RingBuffer::write(self, data)
    }

    fn read(&mut self, out: &mut [T]) -> Result<()> {
        RingBuffer::read(self, out)
    }

    fn fill_count(&self) -> usize {
        RingBuffer::fill_count(self)
    }

    fn available_space(&self) -> usize {
        RingBuffer::available_space(self)
    }

    fn max_fill_count(&self) -> usize {
        RingBuffer::max_fill_count(self)
    }
}
