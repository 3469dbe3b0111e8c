//! Pool error types.

use {corral_driver::DriverError, thiserror::Error};

/// Errors from pool construction and runs.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool needs at least one session slot.
    #[error("pool size must be at least 1")]
    InvalidSize,

    /// A run is already in progress; pools run one at a time.
    #[error("a run is already in progress")]
    AlreadyRunning,

    /// The pool (or streaming run) no longer accepts work.
    #[error("pool is closed")]
    Closed,

    /// Every session slot has been lost; the run cannot make progress.
    #[error("no usable sessions remain")]
    NoSessions,

    /// The streaming dispatcher stopped abnormally.
    #[error("dispatcher failed: {0}")]
    Dispatcher(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}
