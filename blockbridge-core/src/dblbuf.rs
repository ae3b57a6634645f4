//! Block-size adaptation between an outer and an inner processing stage.
//!
//! ```text
//!              process(input, output, frames)                 supply_input()
//! outer stage ─────────────────────────────► [ input FIFO ] ──────────────► inner stage
//!  (I/O clock) ◄───────────────────────────── [ output FIFO ] ◄────────────── (compute)
//!                                                               deliver_output()
//! ```
//!
//! The output FIFO starts out holding `delay` frames of the fill value, so the inner
//! stage's results reach the outer stage exactly `delay` frames late. With blocking
//! FIFOs the adapter never stalls in steady state as long as
//! `delay >= inner_size - gcd(inner_size, outer_size)`.
//!
//! Samples are interleaved; all counts in this API are frames (one sample per
//! channel). Input and output channel counts may differ.

use std::marker::PhantomData;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FifoError, Result};
use crate::fifo::{SharedFifo, Side, SynchronizedRingBuffer};

/// Sizes for a [`DoubleBuffer`], in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DoubleBufferConfig {
    /// Frames per `process` call of the outer stage (upper bound).
    pub outer_size: usize,
    /// Frames per `supply_input` / `deliver_output` of the inner stage.
    pub inner_size: usize,
    /// Added latency in frames.
    pub delay: usize,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl Default for DoubleBufferConfig {
    fn default() -> Self {
        Self {
            outer_size: 256,
            inner_size: 512,
            delay: 256,
            input_channels: 1,
            output_channels: 1,
        }
    }
}

impl DoubleBufferConfig {
    /// Smallest delay with which the adapter never stalls in steady state.
    pub fn minimum_delay(&self) -> usize {
        self.inner_size - gcd(self.inner_size, self.outer_size)
    }

    /// Frames each FIFO can hold.
    ///
    /// # Errors
    /// `FifoError::Construction` if the size does not fit in `usize`.
    pub fn fifo_size(&self) -> Result<usize> {
        self.outer_size
            .max(self.inner_size)
            .checked_add(self.delay)
            .ok_or_else(|| {
                FifoError::Construction(format!(
                    "double buffer delay {} overflows the FIFO size",
                    self.delay
                ))
            })
    }

    /// Reject sizes the adapter cannot work with at all.
    ///
    /// A delay below [`minimum_delay`](Self::minimum_delay) is accepted; it makes
    /// the adapter stall or fail at run time and is logged as a warning on build.
    pub fn validate(&self) -> Result<()> {
        if self.outer_size == 0 || self.inner_size == 0 {
            return Err(FifoError::Config(format!(
                "block sizes must be positive (outer {}, inner {})",
                self.outer_size, self.inner_size
            )));
        }
        if self.input_channels == 0 || self.output_channels == 0 {
            return Err(FifoError::Config(format!(
                "channel counts must be positive (input {}, output {})",
                self.input_channels, self.output_channels
            )));
        }
        self.fifo_size()?
            .checked_mul(self.input_channels.max(self.output_channels))
            .ok_or_else(|| {
                FifoError::Construction("double buffer FIFO size overflows".into())
            })?;
        Ok(())
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Two FIFOs adapting an outer block size to an inner block size.
///
/// Share it (e.g. in an `Arc`) between the outer thread, which calls
/// [`process`](Self::process), and the inner thread, which calls
/// [`supply_input`](Self::supply_input) and [`deliver_output`](Self::deliver_output).
pub struct DoubleBuffer<T, F = SynchronizedRingBuffer<T>> {
    config: DoubleBufferConfig,
    fifo_size: usize,
    input_fifo: F,
    output_fifo: F,
    inner_error: OnceLock<FifoError>,
    outer_error: OnceLock<FifoError>,
    _sample: PhantomData<fn(T) -> T>,
}

impl<T, F> DoubleBuffer<T, F>
where
    T: Clone,
    F: SharedFifo<T>,
{
    /// Build both FIFOs and pre-fill the output FIFO with `delay` frames of `fill`.
    ///
    /// # Errors
    /// `FifoError::Config` / `FifoError::Construction` for unusable sizes.
    pub fn new(config: DoubleBufferConfig, fill: T) -> Result<Self> {
        config.validate()?;
        if config.delay < config.minimum_delay() {
            warn!(
                delay = config.delay,
                minimum = config.minimum_delay(),
                "double buffer delay too small, inner stage may stall"
            );
        }

        let fifo_size = config.fifo_size()?;
        let input_fifo = F::with_fill(fifo_size * config.input_channels, fill.clone())?;
        let output_fifo = F::with_fill(fifo_size * config.output_channels, fill.clone())?;
        let delay_block = vec![fill; config.delay * config.output_channels];
        output_fifo.write(&delay_block)?;

        Ok(Self {
            config,
            fifo_size,
            input_fifo,
            output_fifo,
            inner_error: OnceLock::new(),
            outer_error: OnceLock::new(),
            _sample: PhantomData,
        })
    }

    /// Outer stage: push `frames` frames of `input` and take `frames` frames of
    /// output. Called once per outer block period.
    ///
    /// # Errors
    /// - `FifoError::Config` if `frames > outer_size` or a slice is too short.
    /// - The error armed by [`provoke_outer_error`](Self::provoke_outer_error).
    /// - Any FIFO failure, which means the stages are not sized for each other.
    ///
    /// With a non-blocking FIFO, a missing output block is reported before any
    /// input is enqueued, so a failed call can be retried with the same input.
    pub fn process(&self, input: &[T], output: &mut [T], frames: usize) -> Result<()> {
        if let Some(err) = self.outer_error.get() {
            return Err(err.duplicate());
        }
        if frames > self.config.outer_size {
            return Err(FifoError::Config(format!(
                "{frames} frames exceed the outer block size {}",
                self.config.outer_size
            )));
        }
        let in_len = frames * self.config.input_channels;
        let out_len = frames * self.config.output_channels;
        if input.len() < in_len || output.len() < out_len {
            return Err(FifoError::Config(format!(
                "block of {frames} frames needs {in_len} input and {out_len} output samples, got {} and {}",
                input.len(),
                output.len()
            )));
        }
        if !F::BLOCKING {
            // Only this stage drains the output FIFO, so the fill can only grow
            // between this check and the read below.
            let available = self.output_fifo.fill_count();
            if available < out_len {
                return Err(FifoError::InsufficientData {
                    requested: out_len,
                    available,
                });
            }
        }
        self.input_fifo.write(&input[..in_len])?;
        self.output_fifo.read(&mut output[..out_len])
    }

    /// Inner stage: take exactly `inner_size` frames of input.
    pub fn supply_input(&self, buffer: &mut [T]) -> Result<()> {
        if let Some(err) = self.inner_error.get() {
            return Err(err.duplicate());
        }
        let len = self.config.inner_size * self.config.input_channels;
        let Some(block) = buffer.get_mut(..len) else {
            return Err(FifoError::Config(format!(
                "inner input buffer holds {} samples, needs {len}",
                buffer.len()
            )));
        };
        self.input_fifo.read(block)
    }

    /// Inner stage: hand back exactly `inner_size` frames of output.
    pub fn deliver_output(&self, buffer: &[T]) -> Result<()> {
        if let Some(err) = self.inner_error.get() {
            return Err(err.duplicate());
        }
        let len = self.config.inner_size * self.config.output_channels;
        let Some(block) = buffer.get(..len) else {
            return Err(FifoError::Config(format!(
                "inner output buffer holds {} samples, needs {len}",
                buffer.len()
            )));
        };
        self.output_fifo.write(block)
    }

    /// Make the inner stage fail with `error`, waking it if it is blocked.
    ///
    /// Only the first armed error is kept.
    pub fn provoke_inner_error(&self, error: FifoError) {
        info!(%error, "provoking inner stage error");
        self.input_fifo.set_error(Side::Reader, error.duplicate());
        self.output_fifo.set_error(Side::Writer, error.duplicate());
        let _ = self.inner_error.set(error);
    }

    /// Make the outer stage fail with `error`, waking it if it is blocked.
    ///
    /// Only the first armed error is kept.
    pub fn provoke_outer_error(&self, error: FifoError) {
        info!(%error, "provoking outer stage error");
        self.input_fifo.set_error(Side::Writer, error.duplicate());
        self.output_fifo.set_error(Side::Reader, error.duplicate());
        let _ = self.outer_error.set(error);
    }

    pub fn inner_error(&self) -> Option<&FifoError> {
        self.inner_error.get()
    }

    pub fn outer_error(&self) -> Option<&FifoError> {
        self.outer_error.get()
    }

    /// Input frames waiting for the inner stage.
    pub fn input_fifo_fill_count(&self) -> usize {
        self.input_fifo.fill_count() / self.config.input_channels
    }

    /// Output frames waiting for the outer stage.
    pub fn output_fifo_fill_count(&self) -> usize {
        self.output_fifo.fill_count() / self.config.output_channels
    }

    pub fn input_fifo_space(&self) -> usize {
        self.input_fifo.available_space() / self.config.input_channels
    }

    pub fn output_fifo_space(&self) -> usize {
        self.output_fifo.available_space() / self.config.output_channels
    }
}

impl<T, F> DoubleBuffer<T, F> {
    pub fn config(&self) -> &DoubleBufferConfig {
        &self.config
    }

    pub fn outer_size(&self) -> usize {
        self.config.outer_size
    }

    pub fn inner_size(&self) -> usize {
        self.config.inner_size
    }

    pub fn delay(&self) -> usize {
        self.config.delay
    }

    /// Frames each FIFO can hold.
    pub fn fifo_size(&self) -> usize {
        self.fifo_size
    }

    pub fn input_channels(&self) -> usize {
        self.config.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.config.output_channels
    }
}

impl<T, F> std::fmt::Debug for DoubleBuffer<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleBuffer")
            .field("config", &self.config)
            .field("inner_error", &self.inner_error.get())
            .field("outer_error", &self.outer_error.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::LockFreeRingBuffer;

    fn config(outer: usize, inner: usize, delay: usize) -> DoubleBufferConfig {
        DoubleBufferConfig {
            outer_size: outer,
            inner_size: inner,
            delay,
            input_channels: 1,
            output_channels: 1,
        }
    }

    #[test]
    fn minimum_delay_uses_gcd() {
        assert_eq!(config(256, 512, 0).minimum_delay(), 256);
        assert_eq!(config(512, 256, 0).minimum_delay(), 0);
        assert_eq!(config(300, 512, 0).minimum_delay(), 508);
        assert_eq!(config(64, 64, 0).minimum_delay(), 0);
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(config(0, 64, 0).validate().is_err());
        let mut cfg = config(64, 64, 0);
        cfg.output_channels = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overflowing_delay_is_a_construction_error() {
        let cfg = config(256, 512, usize::MAX - 100);
        assert!(matches!(cfg.fifo_size(), Err(FifoError::Construction(_))));
        assert!(matches!(cfg.validate(), Err(FifoError::Construction(_))));
        assert!(matches!(
            DoubleBuffer::<f32>::new(cfg, 0.0),
            Err(FifoError::Construction(_))
        ));
    }

    #[test]
    fn overflowing_channel_count_is_a_construction_error() {
        let mut cfg = config(256, 512, 256);
        cfg.output_channels = usize::MAX / 2;
        assert!(matches!(cfg.validate(), Err(FifoError::Construction(_))));
    }

    #[test]
    fn failed_process_on_lock_free_fifos_leaves_input_untouched() {
        let db: DoubleBuffer<i32, LockFreeRingBuffer<i32>> =
            DoubleBuffer::new(config(4, 8, 4), 0).unwrap();
        let mut out = [9; 4];
        db.process(&[1, 2, 3, 4], &mut out, 4).unwrap();
        assert_eq!(out, [0; 4]);

        // No inner block delivered yet: the output side is empty.
        assert!(matches!(
            db.process(&[5, 6, 7, 8], &mut out, 4),
            Err(FifoError::InsufficientData {
                requested: 4,
                available: 0
            })
        ));
        assert_eq!(db.input_fifo_fill_count(), 4);

        // Retrying with the same block after the inner stage catches up does not
        // duplicate input.
        let mut inner = [0; 8];
        db.deliver_output(&[10, 20, 30, 40, 50, 60, 70, 80]).unwrap();
        db.process(&[5, 6, 7, 8], &mut out, 4).unwrap();
        assert_eq!(out, [10, 20, 30, 40]);
        db.supply_input(&mut inner).unwrap();
        assert_eq!(inner, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(db.input_fifo_fill_count(), 0);
    }

    #[test]
    fn output_starts_with_delay_frames() {
        let db: DoubleBuffer<f32, LockFreeRingBuffer<f32>> =
            DoubleBuffer::new(config(4, 4, 4), 0.0).unwrap();
        assert_eq!(db.output_fifo_fill_count(), 4);
        assert_eq!(db.input_fifo_fill_count(), 0);
        assert_eq!(db.fifo_size(), 8);
        assert_eq!(db.input_fifo_space(), 8);
        assert_eq!(db.output_fifo_space(), 4);
    }

    #[test]
    fn oversized_outer_block_is_a_config_error() {
        let db: DoubleBuffer<f32, LockFreeRingBuffer<f32>> =
            DoubleBuffer::new(config(4, 4, 4), 0.0).unwrap();
        let input = [1.0f32; 8];
        let mut output = [0.0f32; 8];
        assert!(matches!(
            db.process(&input, &mut output, 5),
            Err(FifoError::Config(_))
        ));
        assert!(matches!(
            db.process(&input[..2], &mut output, 4),
            Err(FifoError::Config(_))
        ));
    }

    #[test]
    fn single_thread_adaptation_delays_by_exactly_delay() {
        // Inner block twice the outer block; delay == inner lets one thread drive
        // both stages in lock-step without ever running dry.
        let (outer, inner, delay) = (4usize, 8usize, 8usize);
        let db: DoubleBuffer<i32, LockFreeRingBuffer<i32>> =
            DoubleBuffer::new(config(outer, inner, delay), 0).unwrap();

        let mut produced = Vec::new();
        let mut next = 1;
        let mut inner_buf = vec![0; inner];
        for _ in 0..10 {
            let input: Vec<i32> = (next..next + outer as i32).collect();
            next += outer as i32;
            let mut output = vec![0; outer];
            db.process(&input, &mut output, outer).unwrap();
            produced.extend_from_slice(&output);

            if db.input_fifo_fill_count() >= inner {
                db.supply_input(&mut inner_buf).unwrap();
                db.deliver_output(&inner_buf).unwrap();
            }
        }

        let expected: Vec<i32> = std::iter::repeat(0)
            .take(delay)
            .chain(1..=(produced.len() - delay) as i32)
            .collect();
        assert_eq!(produced, expected);
    }

    #[test]
    fn channel_counts_may_differ() {
        let cfg = DoubleBufferConfig {
            outer_size: 2,
            inner_size: 2,
            delay: 2,
            input_channels: 2,
            output_channels: 1,
        };
        let db: DoubleBuffer<f32, LockFreeRingBuffer<f32>> =
            DoubleBuffer::new(cfg, 0.0).unwrap();

        let mut out = [9.0f32; 2];
        db.process(&[1.0, -1.0, 2.0, -2.0], &mut out, 2).unwrap();
        assert_eq!(out, [0.0, 0.0]);
        assert_eq!(db.input_fifo_fill_count(), 2);

        // Inner stage: downmix stereo to mono.
        let mut stereo = [0.0f32; 4];
        db.supply_input(&mut stereo).unwrap();
        let mono: Vec<f32> = stereo.chunks(2).map(|f| f[0] + f[1]).collect();
        db.deliver_output(&mono).unwrap();
        assert_eq!(db.output_fifo_fill_count(), 2);
    }

    #[test]
    fn provoked_errors_stick_to_their_stage() {
        let db: DoubleBuffer<f32, LockFreeRingBuffer<f32>> =
            DoubleBuffer::new(config(4, 4, 4), 0.0).unwrap();
        db.provoke_inner_error(FifoError::cancelled(Side::Reader, "teardown"));

        let mut buf = [0.0f32; 4];
        assert!(db.supply_input(&mut buf).unwrap_err().is_cancellation());
        assert!(db.deliver_output(&buf).unwrap_err().is_cancellation());
        assert!(db.inner_error().is_some());

        // Outer side is unaffected.
        let mut out = [0.0f32; 4];
        db.process(&[1.0; 4], &mut out, 4).unwrap();
        assert!(db.outer_error().is_none());

        db.provoke_outer_error(FifoError::cancelled(Side::Writer, "teardown"));
        assert!(db.process(&[1.0; 4], &mut out, 4).is_err());
    }
}
