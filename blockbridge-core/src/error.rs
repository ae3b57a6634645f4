use thiserror::Error;

use crate::fifo::Side;

/// All errors produced by blockbridge-core.
#[derive(Debug, Error)]
pub enum FifoError {
    #[error("cannot write {requested} elements: only {available} slots free")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("cannot read {requested} elements: only {available} available")]
    InsufficientData { requested: usize, available: usize },

    #[error("cannot construct FIFO: {0}")]
    Construction(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{side} cancelled: {reason}")]
    Cancelled { side: Side, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FifoError {
    /// Build a cancellation error for `side`.
    pub fn cancelled(side: Side, reason: impl Into<String>) -> Self {
        FifoError::Cancelled {
            side,
            reason: reason.into(),
        }
    }

    /// Whether this error was injected deliberately to tear down a blocked thread.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FifoError::Cancelled { .. })
    }

    /// Duplicate an armed error so it can be delivered more than once.
    ///
    /// `Io` and `Other` wrap non-`Clone` sources; their copies keep the rendered message.
    pub fn duplicate(&self) -> Self {
        match self {
            FifoError::CapacityExceeded {
                requested,
                available,
            } => FifoError::CapacityExceeded {
                requested: *requested,
                available: *available,
            },
            FifoError::InsufficientData {
                requested,
                available,
            } => FifoError::InsufficientData {
                requested: *requested,
                available: *available,
            },
            FifoError::Construction(msg) => FifoError::Construction(msg.clone()),
            FifoError::Config(msg) => FifoError::Config(msg.clone()),
            FifoError::Cancelled { side, reason } => FifoError::Cancelled {
                side: *side,
                reason: reason.clone(),
            },
            FifoError::Io(e) => FifoError::Io(std::io::Error::new(e.kind(), e.to_string())),
            FifoError::Other(e) => FifoError::Other(anyhow::anyhow!("{e:#}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, FifoError>;
