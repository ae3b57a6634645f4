//! FIFO that tolerates producer/consumer clock drift.
//!
//! ## States
//!
//! ```text
//!            first write() and first read()        consecutive xruns > limit
//! Stopped ───────────────────────────────────► Running ───────────────────────► Stopped
//!    ▲                                                  or explicit stop()          │
//!    └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each side flips its own `started` flag on its first call after a stop; that call
//! also clears the buffer, re-arms `desired_fill_count` virtual silent samples and
//! resets the since-start counters. While not running, writes are dropped and reads
//! return the null value.
//!
//! While running, shortfalls are not errors: a write that does not fit drops the
//! excess, a read that would dip below `min_fill_count` is padded with the null
//! value. Both count as xruns. Too many in a row stop the buffer, which the caller
//! observes through [`DriftingRingBuffer::is_running`] and [`XrunStats`].
//!
//! Startup silence counts against free space: `available_space()` is the ring's
//! free space minus the virtual zeros still owed to the reader, and `fill_count()`
//! includes them.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{Fifo, RingBuffer, Side};
use crate::error::{FifoError, Result};

/// Consecutive xruns tolerated on one side before the buffer stops.
pub const DEFAULT_MAX_XRUNS_IN_SUCCESSION: u32 = 10;

/// Construction parameters for a [`DriftingRingBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DriftConfig {
    /// Reads never drain the buffer below this many elements.
    pub min_fill_count: usize,
    /// Silence delivered to the reader at every start. Also the nominal latency.
    pub desired_fill_count: usize,
    /// Buffer capacity.
    pub max_fill_count: usize,
    pub max_writer_xruns_in_succession: u32,
    pub max_reader_xruns_in_succession: u32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            min_fill_count: 0,
            desired_fill_count: 256,
            max_fill_count: 1024,
            max_writer_xruns_in_succession: DEFAULT_MAX_XRUNS_IN_SUCCESSION,
            max_reader_xruns_in_succession: DEFAULT_MAX_XRUNS_IN_SUCCESSION,
        }
    }
}

impl DriftConfig {
    /// Check `min_fill_count <= desired_fill_count <= max_fill_count`.
    pub fn validate(&self) -> Result<()> {
        if self.desired_fill_count < self.min_fill_count {
            return Err(FifoError::Construction(format!(
                "desired fill count {} is below minimum fill count {}",
                self.desired_fill_count, self.min_fill_count
            )));
        }
        if self.desired_fill_count > self.max_fill_count {
            return Err(FifoError::Construction(format!(
                "desired fill count {} exceeds capacity {}",
                self.desired_fill_count, self.max_fill_count
            )));
        }
        Ok(())
    }
}

/// Point-in-time copy of a drifting buffer's xrun counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrunStats {
    pub writer_xruns_total: u64,
    pub reader_xruns_total: u64,
    pub writer_xruns_since_start: u64,
    pub reader_xruns_since_start: u64,
    pub writer_xruns_in_succession: u32,
    pub reader_xruns_in_succession: u32,
    pub running: bool,
    pub startup_zeros: usize,
}

/// Ring buffer with a start/stop policy, silence injection and xrun accounting.
///
/// Single actor (`&mut self`); wrap it for cross-thread use.
#[derive(Debug)]
pub struct DriftingRingBuffer<T> {
    ring: RingBuffer<T>,
    min_fill_count: usize,
    desired_fill_count: usize,
    writer_started: bool,
    reader_started: bool,
    writer_xruns_total: u64,
    reader_xruns_total: u64,
    writer_xruns_since_start: u64,
    reader_xruns_since_start: u64,
    writer_xruns_in_succession: u32,
    reader_xruns_in_succession: u32,
    max_writer_xruns_in_succession: u32,
    max_reader_xruns_in_succession: u32,
    /// Stands in for missing data.
    null: T,
    /// Virtual null elements still owed to the reader since the last start.
    startup_zeros: usize,
}

impl<T: Clone> DriftingRingBuffer<T> {
    /// Create a drifting buffer whose null value is `T::default()`.
    pub fn new(
        min_fill_count: usize,
        desired_fill_count: usize,
        max_fill_count: usize,
    ) -> Result<Self>
    where
        T: Default,
    {
        Self::with_null(
            min_fill_count,
            desired_fill_count,
            max_fill_count,
            T::default(),
        )
    }

    /// Create a drifting buffer that pads with `null` and initialises its slots with it.
    ///
    /// # Errors
    /// `FifoError::Construction` unless `min <= desired <= max`, or if the storage
    /// cannot be allocated.
    pub fn with_null(
        min_fill_count: usize,
        desired_fill_count: usize,
        max_fill_count: usize,
        null: T,
    ) -> Result<Self> {
        Self::from_config(
            &DriftConfig {
                min_fill_count,
                desired_fill_count,
                max_fill_count,
                ..DriftConfig::default()
            },
            null,
        )
    }

    pub fn from_config(config: &DriftConfig, null: T) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ring: RingBuffer::with_fill(config.max_fill_count, null.clone())?,
            min_fill_count: config.min_fill_count,
            desired_fill_count: config.desired_fill_count,
            writer_started: false,
            reader_started: false,
            writer_xruns_total: 0,
            reader_xruns_total: 0,
            writer_xruns_since_start: 0,
            reader_xruns_since_start: 0,
            writer_xruns_in_succession: 0,
            reader_xruns_in_succession: 0,
            max_writer_xruns_in_succession: config.max_writer_xruns_in_succession,
            max_reader_xruns_in_succession: config.max_reader_xruns_in_succession,
            null,
            startup_zeros: config.desired_fill_count,
        })
    }

    /// Offer `data` to the reader.
    ///
    /// Dropped entirely while stopped. While running, as much as fits is stored and
    /// any excess is dropped and counted as a writer xrun.
    pub fn write(&mut self, data: &[T]) {
        if !self.writer_started {
            self.starting();
            self.writer_started = true;
        }
        if !self.is_running() {
            return;
        }

        let transferred = self.available_space().min(data.len());
        if let Err(e) = self.ring.write(&data[..transferred]) {
            error!("drifting FIFO bookkeeping out of sync on write: {e}");
        }

        if transferred < data.len() {
            self.writer_xruns_total += 1;
            self.writer_xruns_since_start += 1;
            self.writer_xruns_in_succession += 1;
            if self.writer_xruns_in_succession > self.max_writer_xruns_in_succession {
                self.stop_after_xruns(Side::Writer);
            }
        } else {
            self.writer_xruns_in_succession = 0;
        }
    }

    /// Fill `out` with the oldest data, startup silence first.
    ///
    /// While stopped `out` is filled with the null value. While running, whatever
    /// cannot be delivered without dropping below `min_fill_count` is padded with
    /// the null value and counted as a reader xrun.
    pub fn read(&mut self, out: &mut [T]) {
        if !self.reader_started {
            self.starting();
            self.reader_started = true;
        }
        if !self.is_running() {
            out.fill(self.null.clone());
            return;
        }

        let transferred = self
            .fill_count()
            .saturating_sub(self.min_fill_count)
            .min(out.len());
        let zeros = self.startup_zeros.min(transferred);
        out[..zeros].fill(self.null.clone());
        self.startup_zeros -= zeros;

        if let Err(e) = self.ring.read(&mut out[zeros..transferred]) {
            error!("drifting FIFO bookkeeping out of sync on read: {e}");
            out[zeros..transferred].fill(self.null.clone());
        }
        out[transferred..].fill(self.null.clone());

        if transferred < out.len() {
            self.reader_xruns_total += 1;
            self.reader_xruns_since_start += 1;
            self.reader_xruns_in_succession += 1;
            if self.reader_xruns_in_succession > self.max_reader_xruns_in_succession {
                self.stop_after_xruns(Side::Reader);
            }
        } else {
            self.reader_xruns_in_succession = 0;
        }
    }
}

impl<T> DriftingRingBuffer<T> {
    /// Stored elements plus startup silence still owed to the reader.
    pub fn fill_count(&self) -> usize {
        self.ring.fill_count() + self.startup_zeros
    }

    /// Free slots minus startup silence still owed to the reader.
    pub fn available_space(&self) -> usize {
        self.ring.available_space().saturating_sub(self.startup_zeros)
    }

    pub fn max_fill_count(&self) -> usize {
        self.ring.max_fill_count()
    }

    pub fn desired_fill_count(&self) -> usize {
        self.desired_fill_count
    }

    pub fn min_fill_count(&self) -> usize {
        self.min_fill_count
    }

    /// Both sides have started since the last stop.
    pub fn is_running(&self) -> bool {
        self.writer_started && self.reader_started
    }

    pub fn set_max_writer_xruns_in_succession(&mut self, limit: u32) {
        self.max_writer_xruns_in_succession = limit;
    }

    pub fn set_max_reader_xruns_in_succession(&mut self, limit: u32) {
        self.max_reader_xruns_in_succession = limit;
    }

    /// Stop data transmission. Each side restarts on its next call.
    pub fn stop(&mut self) {
        debug!("drifting FIFO stopped");
        self.writer_started = false;
        self.reader_started = false;
    }

    pub fn stats(&self) -> XrunStats {
        XrunStats {
            writer_xruns_total: self.writer_xruns_total,
            reader_xruns_total: self.reader_xruns_total,
            writer_xruns_since_start: self.writer_xruns_since_start,
            reader_xruns_since_start: self.reader_xruns_since_start,
            writer_xruns_in_succession: self.writer_xruns_in_succession,
            reader_xruns_in_succession: self.reader_xruns_in_succession,
            running: self.is_running(),
            startup_zeros: self.startup_zeros,
        }
    }

    fn stop_after_xruns(&mut self, side: Side) {
        warn!(
            %side,
            writer_xruns_total = self.writer_xruns_total,
            reader_xruns_total = self.reader_xruns_total,
            "too many xruns in succession, stopping drifting FIFO"
        );
        self.stop();
    }

    /// Entering the running state from one side.
    fn starting(&mut self) {
        debug!(
            desired_fill_count = self.desired_fill_count,
            "drifting FIFO starting"
        );
        self.ring.clear();
        self.startup_zeros = self.desired_fill_count;
        self.writer_xruns_since_start = 0;
        self.reader_xruns_since_start = 0;
        self.writer_xruns_in_succession = 0;
        self.reader_xruns_in_succession = 0;
    }
}

impl<T: Clone> Fifo<T> for DriftingRingBuffer<T> {
    /// Never fails: shortfalls are recorded as xruns.
    fn write(&mut self, data: &[T]) -> Result<()> {
        DriftingRingBuffer::write(self, data);
        Ok(())
    }

    /// Never fails: shortfalls are padded and recorded as xruns.
    fn read(&mut self, out: &mut [T]) -> Result<()> {
        DriftingRingBuffer::read(self, out);
        Ok(())
    }

    fn fill_count(&self) -> usize {
        DriftingRingBuffer::fill_count(self)
    }

    fn available_space(&self) -> usize {
        DriftingRingBuffer::available_space(self)
    }

    fn max_fill_count(&self) -> usize {
        DriftingRingBuffer::max_fill_count(self)
    }
}
