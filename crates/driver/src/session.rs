//! The session state machine: one container, one WebDriver connection.

use std::sync::Arc;

use {
    corral_factory::{ContainerFactory, ContainerRecord},
    futures::future::BoxFuture,
    thiserror::Error,
    tracing::{debug, info, warn},
};

use crate::{
    browser::DriverConfig,
    client::{ClientError, WEBDRIVER_PATH, WebDriverClient, WebDriverReadyProbe},
    error::DriverError,
    proxy::SquidProxy,
};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Container creation requested.
    Creating,
    /// Container running, automation endpoint not yet confirmed.
    AwaitingReady,
    /// Connected and idle.
    Ready,
    /// Exactly one task in flight.
    Busy,
    /// Unrecoverable; the session must not be reused.
    Error,
    /// Torn down. Terminal.
    Terminated,
}

/// An application-level failure inside a task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task itself reported a failure. Never escalated past the item.
    #[error("task failed: {0}")]
    App(String),

    /// A WebDriver call inside the task failed. Whether this is a fault
    /// depends on the underlying client error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The session was lost out from under the task.
    #[error("session lost: {0}")]
    Session(String),
}

impl TaskError {
    /// Whether this failure means the session's connection is gone.
    pub fn is_fault(&self) -> bool {
        match self {
            Self::App(_) => false,
            Self::Client(e) => e.is_fault(),
            Self::Session(_) => true,
        }
    }
}

/// Tagged result of running one task on a session.
///
/// The tag is what the pool's replacement logic keys on: a `TaskFailed`
/// session stays usable, a `Fault` session must be retired.
#[derive(Debug)]
pub enum RunOutcome<O> {
    /// The task completed; the session returned to `Ready`.
    Completed(O),
    /// The task reported an error; the session returned to `Ready`.
    TaskFailed(TaskError),
    /// The connection dropped; the session is now in `Error`.
    Fault(TaskError),
}

impl<O> RunOutcome<O> {
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    /// The per-item result surfaced to callers.
    pub fn into_result(self) -> Result<O, TaskError> {
        match self {
            Self::Completed(v) => Ok(v),
            Self::TaskFailed(e) | Self::Fault(e) => Err(e),
        }
    }
}

/// Classify a task's result into the outcome tag.
pub(crate) fn classify<O>(result: Result<O, TaskError>) -> RunOutcome<O> {
    match result {
        Ok(value) => RunOutcome::Completed(value),
        Err(e) if e.is_fault() => RunOutcome::Fault(e),
        Err(e) => RunOutcome::TaskFailed(e),
    }
}

/// The session state after an outcome is observed.
pub(crate) fn state_after<O>(outcome: &RunOutcome<O>) -> SessionState {
    match outcome {
        RunOutcome::Completed(_) | RunOutcome::TaskFailed(_) => SessionState::Ready,
        RunOutcome::Fault(_) => SessionState::Error,
    }
}

/// A browser session bound to exactly one container.
///
/// The session has exclusive ownership of its container record: it is the
/// only component allowed to request the container's destruction.
pub struct Session {
    factory: Arc<ContainerFactory>,
    record: ContainerRecord,
    client: WebDriverClient,
    state: SessionState,
}

impl Session {
    /// Create a container for `config`, wait for the WebDriver endpoint
    /// inside it, and open a remote session.
    ///
    /// A readiness timeout leaves the container running for inspection; a
    /// WebDriver connection failure tears the container down, since there is
    /// nothing left to inspect.
    pub async fn create(
        factory: Arc<ContainerFactory>,
        config: &DriverConfig,
        proxy: Option<&SquidProxy>,
    ) -> Result<Self, DriverError> {
        Self::create_inner(factory, config, proxy, false).await
    }

    pub(crate) async fn create_inner(
        factory: Arc<ContainerFactory>,
        config: &DriverConfig,
        proxy: Option<&SquidProxy>,
        recording: bool,
    ) -> Result<Self, DriverError> {
        let spec = config.container_spec(recording);
        debug!(image = %spec.image, browser = config.browser.name(), "creating session");

        // Creating -> AwaitingReady
        let record = factory.create(&spec).await?;

        // AwaitingReady -> Ready, or Error on timeout (container kept)
        let probe = WebDriverReadyProbe::new();
        factory.await_ready(&record, &probe, config.ready_timeout).await?;

        let base_url = format!("http://{}{}", record.endpoint, WEBDRIVER_PATH);
        let capabilities = config.capabilities(proxy.map(SquidProxy::selenium_proxy));
        let http = reqwest::Client::new();

        let client = match WebDriverClient::open(http, base_url, capabilities).await {
            Ok(client) => client,
            Err(e) => {
                warn!(name = record.name, error = %e, "webdriver connect failed, destroying container");
                factory.destroy(&record).await?;
                return Err(e.into());
            },
        };

        info!(
            name = record.name,
            endpoint = %record.endpoint,
            session_id = client.session_id(),
            "session ready"
        );

        Ok(Self {
            factory,
            record,
            client,
            state: SessionState::Ready,
        })
    }

    /// The container name backing this session.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// The session's container record.
    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    pub(crate) fn factory(&self) -> &ContainerFactory {
        &self.factory
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Execute one task against the live connection.
    ///
    /// Only valid from `Ready`. The session is `Busy` while the task runs;
    /// a completed or task-failed run returns it to `Ready`, a connection
    /// fault forces `Error`.
    pub async fn run<O, F>(&mut self, task: F) -> Result<RunOutcome<O>, DriverError>
    where
        F: for<'c> FnOnce(&'c WebDriverClient) -> BoxFuture<'c, Result<O, TaskError>>,
    {
        match self.state {
            SessionState::Ready => {},
            SessionState::Terminated => return Err(DriverError::SessionClosed),
            actual => {
                return Err(DriverError::InvalidState {
                    expected: SessionState::Ready,
                    actual,
                });
            },
        }

        self.state = SessionState::Busy;
        let outcome = classify(task(&self.client).await);
        self.state = state_after(&outcome);
        if outcome.is_fault() {
            warn!(name = self.record.name, "connection fault, session unusable");
        }
        Ok(outcome)
    }

    /// Tear down the remote connection (best-effort) and destroy the
    /// container. Safe from any non-terminated state; idempotent.
    pub async fn quit(&mut self) -> Result<(), DriverError> {
        if self.state == SessionState::Terminated {
            return Ok(());
        }
        debug!(name = self.record.name, "session quit");
        if let Err(e) = self.client.quit().await {
            debug!(name = self.record.name, error = %e, "webdriver quit failed (ignored)");
        }
        self.factory.destroy(&self.record).await?;
        self.state = SessionState::Terminated;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use corral_factory::{ContainerStatus, Endpoint, EngineEndpoint};

    use super::*;

    fn transport_error() -> TaskError {
        // a refused connection is the canonical transport fault
        TaskError::Session("connection refused".into())
    }

    #[test]
    fn classify_success_returns_to_ready() {
        let outcome = classify(Ok(42));
        assert!(matches!(outcome, RunOutcome::Completed(42)));
        assert_eq!(state_after(&outcome), SessionState::Ready);
    }

    #[test]
    fn classify_app_error_is_contained() {
        let outcome = classify::<()>(Err(TaskError::App("no such element".into())));
        assert!(matches!(outcome, RunOutcome::TaskFailed(_)));
        assert_eq!(state_after(&outcome), SessionState::Ready);
        assert!(!outcome.is_fault());
    }

    #[test]
    fn classify_protocol_error_is_contained() {
        let err = TaskError::Client(ClientError::WebDriver {
            error: "stale element reference".into(),
            message: "gone".into(),
        });
        let outcome = classify::<()>(Err(err));
        assert!(matches!(outcome, RunOutcome::TaskFailed(_)));
        assert_eq!(state_after(&outcome), SessionState::Ready);
    }

    #[test]
    fn classify_session_loss_is_a_fault() {
        let outcome = classify::<()>(Err(transport_error()));
        assert!(outcome.is_fault());
        assert_eq!(state_after(&outcome), SessionState::Error);
    }

    /// A factory talking to a mockito engine. Ping answers OK; container
    /// stop/remove answer 404, which destroy treats as already gone.
    async fn fake_engine(
        server: &mut mockito::ServerGuard,
    ) -> (Arc<ContainerFactory>, mockito::Mock) {
        server
            .mock("GET", mockito::Matcher::Regex("_ping".into()))
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;
        server
            .mock("POST", mockito::Matcher::Regex("/containers/.+/stop".into()))
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"no such container"}"#)
            .create_async()
            .await;
        let remove = server
            .mock("DELETE", mockito::Matcher::Regex("/containers/".into()))
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"no such container"}"#)
            .expect(1)
            .create_async()
            .await;

        let factory =
            ContainerFactory::connect(&EngineEndpoint::Http(server.url()), Some("t".into()))
                .await
                .unwrap();
        (Arc::new(factory), remove)
    }

    #[tokio::test]
    async fn quit_twice_destroys_the_container_once() {
        let mut server = mockito::Server::new_async().await;
        let (factory, remove) = fake_engine(&mut server).await;

        let record = ContainerRecord {
            id: "cafe01".into(),
            name: "corral-t-cafe01".into(),
            image: "selenium/standalone-chrome".into(),
            labels: HashMap::new(),
            endpoint: Endpoint { host: "127.0.0.1".into(), port: 4444 },
            status: ContainerStatus::Running,
        };
        let client = WebDriverClient::for_tests(format!("{}/wd/hub", server.url()), "s1");
        let mut session = Session {
            factory,
            record,
            client,
            state: SessionState::Ready,
        };

        session.quit().await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);

        // the second quit is a no-op: no further engine calls
        session.quit().await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        remove.assert_async().await;
    }

    #[tokio::test]
    async fn run_after_quit_fails_with_session_closed() {
        let mut server = mockito::Server::new_async().await;
        let (factory, _remove) = fake_engine(&mut server).await;

        let record = ContainerRecord {
            id: "cafe02".into(),
            name: "corral-t-cafe02".into(),
            image: "selenium/standalone-chrome".into(),
            labels: HashMap::new(),
            endpoint: Endpoint { host: "127.0.0.1".into(), port: 4444 },
            status: ContainerStatus::Running,
        };
        let client = WebDriverClient::for_tests(format!("{}/wd/hub", server.url()), "s2");
        let mut session = Session {
            factory,
            record,
            client,
            state: SessionState::Ready,
        };

        fn noop_task(_client: &WebDriverClient) -> BoxFuture<'_, Result<(), TaskError>> {
            Box::pin(async { Ok(()) })
        }

        session.quit().await.unwrap();
        let err = session.run(noop_task).await.unwrap_err();
        assert!(matches!(err, DriverError::SessionClosed));
    }

    #[test]
    fn outcome_into_result_surfaces_errors() {
        assert_eq!(classify(Ok("v")).into_result().unwrap(), "v");
        assert!(classify::<()>(Err(TaskError::App("x".into())))
            .into_result()
            .is_err());
        assert!(classify::<()>(Err(transport_error())).into_result().is_err());
    }
}
