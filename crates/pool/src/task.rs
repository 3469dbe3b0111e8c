//! Task and driver abstractions the pool schedules over.

use std::sync::Arc;

use {
    async_trait::async_trait,
    corral_driver::{
        DriverError, RunOutcome, Session, SquidProxy, TaskError, VideoSession, WebDriverClient,
    },
    futures::future::BoxFuture,
};

/// One unit of schedulable work: takes ownership of a driver and an input
/// item, hands the driver back together with the tagged outcome.
///
/// Ownership transfer is what lets the pool run tasks concurrently without
/// borrowing its session list across awaits.
pub type PoolTask<S, I, O> =
    Arc<dyn Fn(S, I) -> BoxFuture<'static, (S, RunOutcome<O>)> + Send + Sync>;

/// A driver the pool can own.
#[async_trait]
pub trait PooledDriver: Send + 'static {
    /// Stable identifier for logs.
    fn name(&self) -> &str;

    /// Tear down the driver and whatever backs it. Idempotent.
    async fn quit(&mut self) -> Result<(), DriverError>;
}

#[async_trait]
impl PooledDriver for Session {
    fn name(&self) -> &str {
        Session::name(self)
    }

    async fn quit(&mut self) -> Result<(), DriverError> {
        Session::quit(self).await
    }
}

#[async_trait]
impl PooledDriver for VideoSession {
    fn name(&self) -> &str {
        VideoSession::name(self)
    }

    async fn quit(&mut self) -> Result<(), DriverError> {
        VideoSession::quit(self).await
    }
}

/// A pool-owned helper container, torn down when the pool closes.
#[async_trait]
pub trait Sidecar: Send + Sync + 'static {
    async fn quit(&self) -> Result<(), DriverError>;
}

#[async_trait]
impl Sidecar for SquidProxy {
    async fn quit(&self) -> Result<(), DriverError> {
        SquidProxy::quit(self).await
    }
}

/// Lift a WebDriver closure into a pool task over plain sessions.
///
/// Session lifecycle errors (wrong state, already closed) surface as faults
/// so the pool retires the session instead of reusing it.
pub fn session_task<I, O, F>(f: F) -> PoolTask<Session, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: for<'c> Fn(&'c WebDriverClient, I) -> BoxFuture<'c, Result<O, TaskError>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    Arc::new(move |mut session: Session, item: I| {
        let f = f.clone();
        Box::pin(async move {
            let outcome = match session.run(move |client| f(client, item)).await {
                Ok(outcome) => outcome,
                Err(e) => RunOutcome::Fault(TaskError::Session(e.to_string())),
            };
            (session, outcome)
        })
    })
}

/// [`session_task`] for recorded sessions.
pub fn video_task<I, O, F>(f: F) -> PoolTask<VideoSession, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: for<'c> Fn(&'c WebDriverClient, I) -> BoxFuture<'c, Result<O, TaskError>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    Arc::new(move |mut session: VideoSession, item: I| {
        let f = f.clone();
        Box::pin(async move {
            let outcome = match session.run(move |client| f(client, item)).await {
                Ok(outcome) => outcome,
                Err(e) => RunOutcome::Fault(TaskError::Session(e.to_string())),
            };
            (session, outcome)
        })
    })
}
