//! The driver pool: session ownership, replacement, and blocking runs.

use std::{collections::VecDeque, sync::Arc};

use {
    corral_driver::{DriverConfig, DriverError, RunOutcome, Session, SquidProxy, TaskError},
    corral_factory::ContainerFactory,
    futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    error::PoolError,
    task::{PoolTask, PooledDriver, Sidecar},
};

/// How the pool reacts when a replacement session cannot be created.
///
/// Faulted sessions are always retired and a replacement is always attempted;
/// the policy only decides what happens when that attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementPolicy {
    /// Abort the whole run: if sessions cannot be created, the control plane
    /// is probably down and the remaining items would fail anyway.
    #[default]
    FailFast,
    /// Keep going with one slot fewer, permanently; abort only when no slots
    /// remain.
    Degrade,
}

/// Async constructor for pool sessions. Called for the initial fill and for
/// every replacement.
pub type SessionProvider<S> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<S, DriverError>> + Send + Sync>;

/// What a scheduled future resolves to: a session coming up, or a task
/// handing its session back.
enum Event<S, O> {
    Created(Result<S, DriverError>),
    Finished(usize, S, RunOutcome<O>),
}

/// Mutable pool state. The run in progress holds the lock for its whole
/// duration, which is what makes concurrent runs impossible by construction.
pub(crate) struct PoolInner<S> {
    pub(crate) sessions: Vec<S>,
    pub(crate) capacity: usize,
    pub(crate) closed: bool,
}

/// A fixed-capacity pool of drivers that executes batches of work items.
///
/// Sessions are created lazily on the first run and persist across runs;
/// containers are only torn down by [`DriverPool::close`] or when a session
/// faults.
pub struct DriverPool<S: PooledDriver> {
    pub(crate) provider: SessionProvider<S>,
    pub(crate) inner: Arc<Mutex<PoolInner<S>>>,
    pub(crate) policy: ReplacementPolicy,
    sidecar: Option<Arc<dyn Sidecar>>,
}

impl<S: PooledDriver> std::fmt::Debug for DriverPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverPool")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<S: PooledDriver> DriverPool<S> {
    pub fn new(size: usize, provider: SessionProvider<S>) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        Ok(Self {
            provider,
            inner: Arc::new(Mutex::new(PoolInner {
                sessions: Vec::new(),
                capacity: size,
                closed: false,
            })),
            policy: ReplacementPolicy::default(),
            sidecar: None,
        })
    }

    pub fn with_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attach a helper container the pool tears down on close.
    pub fn with_sidecar(mut self, sidecar: Arc<dyn Sidecar>) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    /// Idle sessions currently held. Waits for any run in progress.
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Remaining session slots. Shrinks under [`ReplacementPolicy::Degrade`].
    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity
    }

    /// Run `task` over every item, at most `size` at a time, and return the
    /// per-item results in submission order.
    ///
    /// Session creation is interleaved with dispatch: the first sessions
    /// start pulling items while the rest are still booting. One failed item
    /// does not stop the batch; the run aborts only when the pool can no
    /// longer field sessions.
    pub async fn execute<I, O>(
        &self,
        task: PoolTask<S, I, O>,
        items: Vec<I>,
    ) -> Result<Vec<Result<O, TaskError>>, PoolError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let mut guard = self
            .inner
            .clone()
            .try_lock_owned()
            .map_err(|_| PoolError::AlreadyRunning)?;
        if guard.closed {
            return Err(PoolError::Closed);
        }
        if guard.capacity == 0 {
            return Err(PoolError::NoSessions);
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let total = items.len();
        let target = guard.capacity.min(total);
        debug!(items = total, sessions = guard.sessions.len(), target, "starting run");

        let mut queue: VecDeque<(usize, I)> = items.into_iter().enumerate().collect();
        let mut slots: Vec<Option<Result<O, TaskError>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Event<S, O>>> =
            FuturesUnordered::new();
        let mut abort: Option<PoolError> = None;
        // live + booting + busy slots for this run; only a failed creation
        // shrinks it
        let mut run_slots = target;

        for _ in guard.sessions.len()..target {
            let creating = (self.provider)();
            in_flight.push(Box::pin(async move { Event::Created(creating.await) }));
        }

        loop {
            if abort.is_none() {
                while let Some((idx, item)) = queue.pop_front() {
                    let Some(session) = guard.sessions.pop() else {
                        queue.push_front((idx, item));
                        break;
                    };
                    let task = Arc::clone(&task);
                    in_flight.push(Box::pin(async move {
                        let (session, outcome) = task(session, item).await;
                        Event::Finished(idx, session, outcome)
                    }));
                }
            }

            // everything is dispatched, booting, or abandoned at this point
            let Some(event) = in_flight.next().await else {
                break;
            };

            match event {
                Event::Created(Ok(session)) => guard.sessions.push(session),
                Event::Created(Err(e)) => {
                    self.creation_failed(&mut guard.capacity, &mut run_slots, e, &mut abort);
                },
                Event::Finished(idx, session, outcome) => {
                    if outcome.is_fault() {
                        let mut dead = session;
                        warn!(name = dead.name(), "retiring faulted session");
                        if let Err(e) = dead.quit().await {
                            warn!(error = %e, "failed to quit faulted session");
                        }
                        if abort.is_none() {
                            let creating = (self.provider)();
                            in_flight
                                .push(Box::pin(async move { Event::Created(creating.await) }));
                        }
                    } else {
                        guard.sessions.push(session);
                    }
                    slots[idx] = Some(outcome.into_result());
                },
            }
        }

        if let Some(e) = abort {
            warn!(error = %e, "run aborted");
            return Err(e);
        }

        let results: Vec<Result<O, TaskError>> = slots.into_iter().flatten().collect();
        debug_assert_eq!(results.len(), total);
        info!(items = total, "run complete");
        Ok(results)
    }

    /// Quit every session (and the sidecar, if any). Waits for a run in
    /// progress to finish first. Idempotent.
    pub async fn close(&self) -> Result<(), PoolError> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Ok(());
        }
        guard.closed = true;
        let sessions = std::mem::take(&mut guard.sessions);
        drop(guard);

        for mut session in sessions {
            if let Err(e) = session.quit().await {
                warn!(name = session.name(), error = %e, "failed to quit session on close");
            }
        }
        if let Some(sidecar) = &self.sidecar {
            if let Err(e) = sidecar.quit().await {
                warn!(error = %e, "failed to quit sidecar on close");
            }
        }
        info!("pool closed");
        Ok(())
    }

    /// Apply the replacement policy after a session failed to come up.
    fn creation_failed(
        &self,
        capacity: &mut usize,
        run_slots: &mut usize,
        cause: DriverError,
        abort: &mut Option<PoolError>,
    ) {
        if abort.is_some() {
            return;
        }
        match self.policy {
            ReplacementPolicy::FailFast => *abort = Some(PoolError::Driver(cause)),
            ReplacementPolicy::Degrade => {
                *capacity = capacity.saturating_sub(1);
                *run_slots = run_slots.saturating_sub(1);
                warn!(error = %cause, capacity, "session creation failed, capacity reduced");
                if *run_slots == 0 {
                    *abort = Some(PoolError::NoSessions);
                }
            },
        }
    }
}

impl DriverPool<Session> {
    /// A pool of plain sessions for one browser configuration, optionally
    /// routed through a shared squid sidecar the pool owns.
    pub async fn for_browser(
        size: usize,
        factory: Arc<ContainerFactory>,
        config: DriverConfig,
        use_proxy: bool,
    ) -> Result<Self, PoolError> {
        let proxy = if use_proxy {
            let proxy = SquidProxy::create(Arc::clone(&factory))
                .await
                .map_err(PoolError::Driver)?;
            Some(Arc::new(proxy))
        } else {
            None
        };

        let provider: SessionProvider<Session> = {
            let proxy = proxy.clone();
            Arc::new(move || {
                let factory = Arc::clone(&factory);
                let config = config.clone();
                let proxy = proxy.clone();
                Box::pin(async move { Session::create(factory, &config, proxy.as_deref()).await })
            })
        };

        let mut pool = Self::new(size, provider)?;
        if let Some(proxy) = proxy {
            pool = pool.with_sidecar(proxy);
        }
        Ok(pool)
    }
}
