//! # blockbridge-core
//!
//! Real-time safe FIFOs for moving audio blocks between threads and clock domains.
//!
//! ## Architecture
//!
//! ```text
//! I/O callback ──► DriftingRingBuffer ──► DoubleBuffer ──► inner processing thread
//!  (outer block)    (clock drift)          │  (block-size adaptation, fixed delay)
//!                                          ◄──────────────── processed blocks
//!
//! control thread ──► ConfigHandoffQueue ──► inner processing thread (poll per block)
//! ```
//!
//! [`RingBuffer`](fifo::RingBuffer) is the single-threaded baseline. Cross-thread data
//! goes through [`LockFreeRingBuffer`](fifo::LockFreeRingBuffer) (wait-free, audio
//! thread safe) or [`SynchronizedRingBuffer`](fifo::SynchronizedRingBuffer) (blocking,
//! worker threads only). Nothing on a real-time path allocates or locks after
//! construction, except through the blocking buffer.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod dblbuf;
pub mod error;
pub mod fifo;
pub mod handoff;
pub mod soak;

// Convenience re-exports for downstream crates
pub use dblbuf::{DoubleBuffer, DoubleBufferConfig};
pub use error::{FifoError, Result};
pub use fifo::{
    DriftConfig, DriftingRingBuffer, Fifo, LockFreeRingBuffer, RingBuffer, SharedFifo, Side,
    SynchronizedRingBuffer, XrunStats,
};
pub use handoff::{ConfigConsumer, ConfigHandoffQueue, ConfigProducer};
