//! Blocking FIFO for non-real-time producer/consumer pairs.
//!
//! A write that does not fit waits (with the mutex released) until the reader has
//! made room; a read that cannot be satisfied waits until the writer has produced.
//! Either side can be armed with a failure that it raises instead of waiting, which
//! is how a shutdown path tears down a thread blocked here.
//!
//! Not real-time safe. Use [`LockFreeRingBuffer`](super::LockFreeRingBuffer) on
//! audio threads.

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::info;

use super::{RingBuffer, SharedFifo, Side};
use crate::error::{FifoError, Result};

/// Wait/notify capability used by [`SynchronizedRingBuffer`].
///
/// The mutex itself is a `parking_lot::Mutex` owned by the buffer; implementors
/// provide the two signals that move waiters along. All methods are called with the
/// buffer's lock held.
pub trait WaitPlatform: Send + Sync {
    /// Writer side: release `guard`, wait for the reader to consume, re-acquire.
    fn wait_for_decrease<S>(&self, guard: &mut MutexGuard<'_, S>);

    /// Reader side: release `guard`, wait for the writer to produce, re-acquire.
    fn wait_for_increase<S>(&self, guard: &mut MutexGuard<'_, S>);

    /// Called by the writer after producing.
    fn increment(&self);

    /// Called by the reader after consuming.
    fn decrement(&self);

    /// Wake every waiter on both sides (used when a failure is armed).
    fn wake_all(&self);
}

/// Default platform: one condition variable per direction.
#[derive(Debug, Default)]
pub struct CondvarPlatform {
    increased: Condvar,
    decreased: Condvar,
}

impl WaitPlatform for CondvarPlatform {
    fn wait_for_decrease<S>(&self, guard: &mut MutexGuard<'_, S>) {
        self.decreased.wait(guard);
    }

    fn wait_for_increase<S>(&self, guard: &mut MutexGuard<'_, S>) {
        self.increased.wait(guard);
    }

    fn increment(&self) {
        self.increased.notify_one();
    }

    fn decrement(&self) {
        self.decreased.notify_one();
    }

    fn wake_all(&self) {
        self.increased.notify_all();
        self.decreased.notify_all();
    }
}

#[derive(Debug)]
struct State<T> {
    ring: RingBuffer<T>,
    reader_error: Option<FifoError>,
    writer_error: Option<FifoError>,
}

impl<T> State<T> {
    fn armed(&self, side: Side) -> Option<&FifoError> {
        match side {
            Side::Reader => self.reader_error.as_ref(),
            Side::Writer => self.writer_error.as_ref(),
        }
    }
}

/// Ring buffer whose `write` blocks while full and whose `read` blocks while empty.
#[derive(Debug)]
pub struct SynchronizedRingBuffer<T, P = CondvarPlatform> {
    state: Mutex<State<T>>,
    platform: P,
}

impl<T: Clone> SynchronizedRingBuffer<T> {
    /// Create a buffer holding at most `max_fill_count` elements with the default
    /// condition-variable platform.
    pub fn new(max_fill_count: usize) -> Result<Self>
    where
        T: Default,
    {
        Self::with_platform(max_fill_count, T::default(), CondvarPlatform::default())
    }
}

impl<T: Clone, P: WaitPlatform> SynchronizedRingBuffer<T, P> {
    pub fn with_platform(max_fill_count: usize, fill: T, platform: P) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(State {
                ring: RingBuffer::with_fill(max_fill_count, fill)?,
                reader_error: None,
                writer_error: None,
            }),
            platform,
        })
    }

    /// Append all of `data`, waiting for the reader to make room if necessary.
    ///
    /// # Errors
    /// - `FifoError::Config` immediately if `data` is larger than the whole buffer
    ///   (waiting could never succeed).
    /// - The armed writer failure, if one is set while this call would wait.
    pub fn write(&self, data: &[T]) -> Result<()> {
        let mut state = self.state.lock();
        let max = state.ring.max_fill_count();
        if data.len() > max {
            return Err(FifoError::Config(format!(
                "write of {} elements can never fit a FIFO of {max}",
                data.len()
            )));
        }
        while state.ring.available_space() < data.len() {
            if let Some(err) = state.armed(Side::Writer) {
                return Err(err.duplicate());
            }
            self.platform.wait_for_decrease(&mut state);
        }
        state.ring.write(data)?;
        self.platform.increment();
        Ok(())
    }

    /// Fill all of `out`, waiting for the writer to produce if necessary.
    ///
    /// # Errors
    /// - `FifoError::Config` immediately if `out` is larger than the whole buffer.
    /// - The armed reader failure, if one is set while this call would wait.
    pub fn read(&self, out: &mut [T]) -> Result<()> {
        let mut state = self.state.lock();
        let max = state.ring.max_fill_count();
        if out.len() > max {
            return Err(FifoError::Config(format!(
                "read of {} elements can never be served by a FIFO of {max}",
                out.len()
            )));
        }
        while state.ring.fill_count() < out.len() {
            if let Some(err) = state.armed(Side::Reader) {
                return Err(err.duplicate());
            }
            self.platform.wait_for_increase(&mut state);
        }
        state.ring.read(out)?;
        self.platform.decrement();
        Ok(())
    }

    /// Arm `error` for `side` and wake it if it is currently waiting.
    pub fn set_error(&self, side: Side, error: FifoError) {
        let mut state = self.state.lock();
        info!(%side, %error, "arming FIFO cancellation");
        match side {
            Side::Reader => state.reader_error = Some(error),
            Side::Writer => state.writer_error = Some(error),
        }
        self.platform.wake_all();
    }
}

impl<T, P> SynchronizedRingBuffer<T, P> {
    pub fn fill_count(&self) -> usize {
        self.state.lock().ring.fill_count()
    }

    pub fn available_space(&self) -> usize {
        self.state.lock().ring.available_space()
    }

    pub fn max_fill_count(&self) -> usize {
        self.state.lock().ring.max_fill_count()
    }
}

impl<T, P> SharedFifo<T> for SynchronizedRingBuffer<T, P>
where
    T: Clone + Send,
    P: WaitPlatform + Default,
{
    const BLOCKING: bool = true;

    fn with_fill(max_fill_count: usize, fill: T) -> Result<Self> {
        Self::with_platform(max_fill_count, fill, P::default())
    }

    fn write(&self, data: &[T]) -> Result<()> {
        SynchronizedRingBuffer::write(self, data)
    }

    fn read(&self, out: &mut [T]) -> Result<()> {
        SynchronizedRingBuffer::read(self, out)
    }

    fn fill_count(&self) -> usize {
        SynchronizedRingBuffer::fill_count(self)
    }

    fn available_space(&self) -> usize {
        SynchronizedRingBuffer::available_space(self)
    }

    fn max_fill_count(&self) -> usize {
        SynchronizedRingBuffer::max_fill_count(self)
    }

    fn set_error(&self, side: Side, error: FifoError) {
        SynchronizedRingBuffer::set_error(self, side, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn behaves_like_ring_when_never_blocking() {
        let fifo = SynchronizedRingBuffer::new(4).unwrap();
        fifo.write(&[1, 2, 3]).unwrap();
        assert_eq!(fifo.fill_count(), 3);
        let mut out = [0; 3];
        fifo.read(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(fifo.available_space(), 4);
    }

    #[test]
    fn oversized_requests_fail_instead_of_deadlocking() {
        let fifo = SynchronizedRingBuffer::<u8>::new(2).unwrap();
        fifo.write(&[1]).unwrap();
        assert!(matches!(fifo.write(&[0; 3]), Err(FifoError::Config(_))));
        let mut out = [0u8; 3];
        assert!(matches!(fifo.read(&mut out), Err(FifoError::Config(_))));
        assert_eq!(fifo.fill_count(), 1);
    }

    #[test]
    fn writer_waits_for_reader() {
        let fifo = Arc::new(SynchronizedRingBuffer::new(2).unwrap());
        fifo.write(&[1u32, 2]).unwrap();

        let writer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.write(&[3, 4]))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished(), "writer should block while full");

        let mut out = [0u32; 2];
        fifo.read(&mut out).unwrap();
        assert_eq!(out, [1, 2]);

        writer.join().expect("writer panicked").unwrap();
        fifo.read(&mut out).unwrap();
        assert_eq!(out, [3, 4]);
    }

    #[test]
    fn reader_waits_for_writer() {
        let fifo = Arc::new(SynchronizedRingBuffer::new(8).unwrap());
        let reader = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let mut out = [0i32; 4];
                fifo.read(&mut out).map(|_| out)
            })
        };

        fifo.write(&[1, 2]).unwrap();
        thread::sleep(Duration::from_millis(10));
        fifo.write(&[3, 4]).unwrap();

        let out = reader.join().expect("reader panicked").unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn armed_error_releases_blocked_reader() {
        let fifo = Arc::new(SynchronizedRingBuffer::<f32>::new(8).unwrap());
        let reader = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let mut out = [0.0f32; 4];
                fifo.read(&mut out)
            })
        };

        thread::sleep(Duration::from_millis(20));
        fifo.set_error(Side::Reader, FifoError::cancelled(Side::Reader, "shutdown"));

        let err = reader.join().expect("reader panicked").unwrap_err();
        assert!(err.is_cancellation());
        assert!(err.to_string().contains("shutdown"));
    }

    #[test]
    fn armed_error_releases_blocked_writer() {
        let fifo = Arc::new(SynchronizedRingBuffer::<f32>::new(4).unwrap());
        fifo.write(&[1.0; 4]).unwrap();
        let writer = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || fifo.write(&[2.0; 2]))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished(), "writer should block while full");
        fifo.set_error(Side::Writer, FifoError::cancelled(Side::Writer, "shutdown"));

        let err = writer.join().expect("writer panicked").unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(fifo.fill_count(), 4, "cancelled write must not store anything");
    }

    /// Condition variables plus a tally of the signals the buffer sends.
    #[derive(Default)]
    struct CountingPlatform {
        condvars: CondvarPlatform,
        increments: AtomicUsize,
        decrements: AtomicUsize,
        waits: AtomicUsize,
    }

    impl WaitPlatform for CountingPlatform {
        fn wait_for_decrease<S>(&self, guard: &mut MutexGuard<'_, S>) {
            self.waits.fetch_add(1, Ordering::SeqCst);
            self.condvars.wait_for_decrease(guard);
        }

        fn wait_for_increase<S>(&self, guard: &mut MutexGuard<'_, S>) {
            self.waits.fetch_add(1, Ordering::SeqCst);
            self.condvars.wait_for_increase(guard);
        }

        fn increment(&self) {
            self.increments.fetch_add(1, Ordering::SeqCst);
            self.condvars.increment();
        }

        fn decrement(&self) {
            self.decrements.fetch_add(1, Ordering::SeqCst);
            self.condvars.decrement();
        }

        fn wake_all(&self) {
            self.condvars.wake_all();
        }
    }

    #[test]
    fn platform_is_signalled_once_per_successful_transfer() {
        let fifo =
            SynchronizedRingBuffer::with_platform(4, 0u16, CountingPlatform::default()).unwrap();
        fifo.write(&[1, 2]).unwrap();
        fifo.write(&[3]).unwrap();
        assert!(fifo.write(&[0; 5]).is_err());
        let mut out = [0u16; 3];
        fifo.read(&mut out).unwrap();
        assert!(fifo.read(&mut [0u16; 5]).is_err());

        assert_eq!(out, [1, 2, 3]);
        assert_eq!(fifo.platform.increments.load(Ordering::SeqCst), 2);
        assert_eq!(fifo.platform.decrements.load(Ordering::SeqCst), 1);
        assert_eq!(fifo.platform.waits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_platform_carries_blocking_handoff() {
        let fifo = Arc::new(
            SynchronizedRingBuffer::with_platform(2, 0u32, CountingPlatform::default()).unwrap(),
        );
        let reader = {
            let fifo = Arc::clone(&fifo);
            thread::spawn(move || {
                let mut out = [0u32; 2];
                fifo.read(&mut out).map(|_| out)
            })
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fifo.platform.waits.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "reader never waited");
            thread::sleep(Duration::from_millis(1));
        }
        fifo.write(&[7, 8]).unwrap();
        assert_eq!(reader.join().expect("reader panicked").unwrap(), [7, 8]);
        assert!(fifo.platform.waits.load(Ordering::SeqCst) >= 1);
        assert_eq!(fifo.platform.decrements.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn armed_error_does_not_affect_calls_that_need_no_wait() {
        let fifo = SynchronizedRingBuffer::new(4).unwrap();
        fifo.set_error(Side::Writer, FifoError::cancelled(Side::Writer, "stop"));
        fifo.write(&[1u8]).unwrap();
        assert!(fifo.write(&[2, 3, 4, 5]).unwrap_err().is_cancellation());
    }
}
