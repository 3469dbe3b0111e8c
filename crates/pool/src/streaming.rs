//! Streaming runs: feed items in over time, consume results as they land.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use {
    corral_driver::{DriverError, RunOutcome, TaskError},
    futures::{future::BoxFuture, stream::FuturesUnordered, Stream, StreamExt},
    tokio::sync::{mpsc, Mutex, OwnedMutexGuard},
    tracing::{debug, warn},
};

use crate::{
    error::PoolError,
    pool::{DriverPool, PoolInner, ReplacementPolicy, SessionProvider},
    task::{PoolTask, PooledDriver},
};

/// Invoked with each result as it arrives, before it is queued for
/// [`AsyncExecution::results`].
pub type ResultCallback<O> = Arc<dyn Fn(&Result<O, TaskError>) + Send + Sync>;

enum Feed<I> {
    Item(I),
    Finish,
}

enum Event<S, O> {
    Created(Result<S, DriverError>),
    Finished(S, RunOutcome<O>),
}

impl<S: PooledDriver> DriverPool<S> {
    /// Start a streaming run of `task`, seeded with `items`, and return
    /// immediately.
    ///
    /// More items can be added through the returned handle until it is
    /// stopped. `on_result` (if supplied) sees every result in arrival
    /// order. The pool stays locked to other runs until the handle is
    /// stopped and drained.
    pub async fn execute_async<I, O>(
        &self,
        task: PoolTask<S, I, O>,
        items: Vec<I>,
        on_result: Option<ResultCallback<O>>,
    ) -> Result<AsyncExecution<I, O>, PoolError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let guard = self
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

        let (item_tx, item_rx) = mpsc::unbounded_channel::<Feed<I>>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<Result<O, TaskError>>();
        let accepting = Arc::new(AtomicBool::new(true));
        let fatal = Arc::new(Mutex::new(None));

        debug!(seed = items.len(), sessions = guard.sessions.len(), "starting streaming run");
        let run = StreamingRun {
            guard,
            task,
            provider: Arc::clone(&self.provider),
            policy: self.policy,
            results: result_tx,
            on_result,
            accepting: Arc::clone(&accepting),
            fatal: Arc::clone(&fatal),
        };
        let worker = tokio::spawn(run.dispatch(items, item_rx));

        Ok(AsyncExecution {
            item_tx,
            results: Arc::new(Mutex::new(result_rx)),
            accepting,
            fatal,
            worker,
        })
    }
}

/// Handle to a streaming run.
///
/// Dropping the handle without [`AsyncExecution::join`] closes intake; items
/// already queued still run, their results are discarded with the channel.
pub struct AsyncExecution<I, O> {
    item_tx: mpsc::UnboundedSender<Feed<I>>,
    results: Arc<Mutex<mpsc::UnboundedReceiver<Result<O, TaskError>>>>,
    accepting: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<PoolError>>>,
    worker: tokio::task::JoinHandle<()>,
}

impl<I, O> AsyncExecution<I, O> {
    /// Queue one more item. Rejected once the run has been stopped.
    pub fn add(&self, item: I) -> Result<(), PoolError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        self.item_tx
            .send(Feed::Item(item))
            .map_err(|_| PoolError::Closed)
    }

    pub fn add_all(&self, items: impl IntoIterator<Item = I>) -> Result<(), PoolError> {
        for item in items {
            self.add(item)?;
        }
        Ok(())
    }

    /// Close intake. Items queued before the stop still run and their
    /// results still arrive; later [`AsyncExecution::add`] calls fail.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.item_tx.send(Feed::Finish);
    }

    /// Next completed result, `None` once the run has drained.
    pub async fn next_result(&self) -> Option<Result<O, TaskError>> {
        self.results.lock().await.recv().await
    }

    /// Results in completion order, ending when the run drains. Each result
    /// is yielded once; a fresh call continues where the last consumer left
    /// off rather than replaying.
    pub fn results(&self) -> impl Stream<Item = Result<O, TaskError>> {
        futures::stream::unfold(Arc::clone(&self.results), |results| async move {
            let next = results.lock().await.recv().await;
            next.map(|item| (item, results))
        })
    }

    /// Stop intake, wait for every queued item to finish, and surface any
    /// fatal pool error from the run.
    pub async fn join(self) -> Result<(), PoolError> {
        self.stop();
        let Self { item_tx, worker, fatal, .. } = self;
        drop(item_tx);
        worker
            .await
            .map_err(|e| PoolError::Dispatcher(e.to_string()))?;
        let err = fatal.lock().await.take();
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The dispatcher behind a streaming run. Owns the pool lock until the run
/// drains, then releases it by dropping the guard.
struct StreamingRun<S: PooledDriver, I, O> {
    guard: OwnedMutexGuard<PoolInner<S>>,
    task: PoolTask<S, I, O>,
    provider: SessionProvider<S>,
    policy: ReplacementPolicy,
    results: mpsc::UnboundedSender<Result<O, TaskError>>,
    on_result: Option<ResultCallback<O>>,
    accepting: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<PoolError>>>,
}

impl<S, I, O> StreamingRun<S, I, O>
where
    S: PooledDriver,
    I: Send + 'static,
    O: Send + 'static,
{
    async fn dispatch(mut self, seed: Vec<I>, mut feed: mpsc::UnboundedReceiver<Feed<I>>) {
        let mut pending: VecDeque<I> = seed.into();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Event<S, O>>> =
            FuturesUnordered::new();
        let mut open = true;
        let mut aborted = false;
        let mut run_slots = self.guard.capacity;

        // item count is unknown, so boot the full complement up front
        for _ in self.guard.sessions.len()..self.guard.capacity {
            let creating = (self.provider)();
            in_flight.push(Box::pin(async move { Event::Created(creating.await) }));
        }

        loop {
            if !aborted {
                while let Some(item) = pending.pop_front() {
                    let Some(session) = self.guard.sessions.pop() else {
                        pending.push_front(item);
                        break;
                    };
                    let task = Arc::clone(&self.task);
                    in_flight.push(Box::pin(async move {
                        let (session, outcome) = task(session, item).await;
                        Event::Finished(session, outcome)
                    }));
                }
            }

            // with no work in flight and no way to get more, we are done;
            // checked before select! so it never waits with nothing enabled
            if in_flight.is_empty() && (aborted || (!open && pending.is_empty())) {
                break;
            }

            tokio::select! {
                msg = feed.recv(), if open && !aborted => {
                    match msg {
                        Some(Feed::Item(item)) => pending.push_back(item),
                        Some(Feed::Finish) | None => {
                            open = false;
                            self.accepting.store(false, Ordering::SeqCst);
                            debug!(pending = pending.len(), "intake closed, draining");
                        },
                    }
                },
                Some(event) = in_flight.next(), if !in_flight.is_empty() => {
                    match event {
                        Event::Created(Ok(session)) => self.guard.sessions.push(session),
                        Event::Created(Err(e)) => {
                            if !aborted {
                                aborted = self.creation_failed(&mut run_slots, e).await;
                            }
                        },
                        Event::Finished(session, outcome) => {
                            let fault = outcome.is_fault();
                            self.deliver(outcome.into_result());
                            if !fault {
                                self.guard.sessions.push(session);
                                continue;
                            }
                            let mut dead = session;
                            warn!(name = dead.name(), "retiring faulted session");
                            if let Err(e) = dead.quit().await {
                                warn!(error = %e, "failed to quit faulted session");
                            }
                            if !aborted {
                                let creating = (self.provider)();
                                in_flight.push(Box::pin(async move {
                                    Event::Created(creating.await)
                                }));
                            }
                        },
                    }
                },
            }
        }

        debug!(dropped = pending.len(), "streaming run finished");
    }

    fn deliver(&self, result: Result<O, TaskError>) {
        if let Some(on_result) = &self.on_result {
            on_result(&result);
        }
        let _ = self.results.send(result);
    }

    /// Returns whether the run is now aborted.
    async fn creation_failed(&mut self, run_slots: &mut usize, cause: DriverError) -> bool {
        match self.policy {
            ReplacementPolicy::FailFast => {
                *self.fatal.lock().await = Some(PoolError::Driver(cause));
            },
            ReplacementPolicy::Degrade => {
                self.guard.capacity = self.guard.capacity.saturating_sub(1);
                *run_slots = run_slots.saturating_sub(1);
                warn!(error = %cause, capacity = self.guard.capacity,
                    "session creation failed, capacity reduced");
                if *run_slots > 0 {
                    return false;
                }
                *self.fatal.lock().await = Some(PoolError::NoSessions);
            },
        }
        self.accepting.store(false, Ordering::SeqCst);
        true
    }
}
