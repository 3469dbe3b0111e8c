//! Concurrent task execution over a fleet of browser sessions.
//!
//! A [`DriverPool`] owns up to `size` sessions and fans work items out across
//! them, never running more tasks at once than it has sessions. Two modes:
//!
//! - **blocking**: [`DriverPool::execute`] takes every item up front and
//!   returns results in submission order once the last item finishes;
//! - **streaming**: [`DriverPool::execute_async`] returns an
//!   [`AsyncExecution`] handle that accepts items over time and yields
//!   results in completion order.
//!
//! Per-item failures stay per-item. A session that loses its connection is
//! retired and a replacement is brought up; [`ReplacementPolicy`] decides
//! whether a failed replacement aborts the run or just shrinks the pool.
//! Sessions persist across runs until [`DriverPool::close`].

pub mod error;
pub mod pool;
pub mod streaming;
pub mod task;

pub use {
    error::PoolError,
    pool::{DriverPool, ReplacementPolicy, SessionProvider},
    streaming::{AsyncExecution, ResultCallback},
    task::{PoolTask, PooledDriver, Sidecar, session_task, video_task},
};
