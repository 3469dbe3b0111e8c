//! Browser sessions bound to disposable containers.
//!
//! A [`Session`] owns exactly one container (created through
//! `corral-factory`) and one WebDriver connection to the browser service
//! running inside it, and drives both through an explicit state machine:
//!
//! ```text
//! Creating -> AwaitingReady -> Ready <-> Busy
//!                 |               |        |
//!                 v               v        v (connection fault)
//!               Error         Terminated  Error
//! ```
//!
//! Task-level failures return the session to `Ready`; connection-level
//! faults force `Error` and the session must not be reused. [`VideoSession`]
//! decorates the same state machine with an in-container screen recording,
//! and [`SquidProxy`] is an optional caching sidecar sessions can route
//! their traffic through.

pub mod browser;
pub mod client;
pub mod error;
pub mod proxy;
pub mod session;
pub mod video;

pub use {
    browser::{Browser, DriverConfig},
    client::{ClientError, WebDriverClient, WebDriverReadyProbe},
    error::DriverError,
    proxy::SquidProxy,
    session::{RunOutcome, Session, SessionState, TaskError},
    video::{VideoConfig, VideoSession},
};
