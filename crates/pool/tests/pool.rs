//! Pool scheduling behavior over a fake driver; no container runtime needed.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use {
    corral_driver::{DriverError, RunOutcome, TaskError},
    corral_pool::{
        DriverPool, PoolError, PoolTask, PooledDriver, ReplacementPolicy, SessionProvider,
    },
    futures::StreamExt,
    tokio::time::sleep,
};

#[derive(Debug)]
struct FakeDriver {
    name: String,
    quits: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl PooledDriver for FakeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn quit(&mut self) -> Result<(), DriverError> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider counting creations; `quits` is shared across all drivers.
fn provider(created: Arc<AtomicUsize>, quits: Arc<AtomicUsize>) -> SessionProvider<FakeDriver> {
    Arc::new(move || {
        let created = Arc::clone(&created);
        let quits = Arc::clone(&quits);
        Box::pin(async move {
            let n = created.fetch_add(1, Ordering::SeqCst);
            Ok(FakeDriver { name: format!("fake-{n}"), quits })
        })
    })
}

/// Provider whose creations fail after the first `limit`.
fn limited_provider(
    created: Arc<AtomicUsize>,
    quits: Arc<AtomicUsize>,
    limit: usize,
) -> SessionProvider<FakeDriver> {
    Arc::new(move || {
        let created = Arc::clone(&created);
        let quits = Arc::clone(&quits);
        Box::pin(async move {
            let n = created.fetch_add(1, Ordering::SeqCst);
            if n >= limit {
                return Err(DriverError::SessionClosed);
            }
            Ok(FakeDriver { name: format!("fake-{n}"), quits })
        })
    })
}

fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
}

/// Task that sleeps for the item's value in milliseconds, then returns it
/// times ten.
fn sleepy_task() -> PoolTask<FakeDriver, u64, u64> {
    Arc::new(|driver, item: u64| {
        Box::pin(async move {
            sleep(Duration::from_millis(item)).await;
            (driver, RunOutcome::Completed(item * 10))
        })
    })
}

/// Task that fails items in `bad` with an app error and faults items in
/// `fatal` with a lost connection.
fn flaky_task(bad: Vec<u64>, fatal: Vec<u64>) -> PoolTask<FakeDriver, u64, u64> {
    Arc::new(move |driver, item: u64| {
        let bad = bad.clone();
        let fatal = fatal.clone();
        Box::pin(async move {
            let outcome = if fatal.contains(&item) {
                RunOutcome::Fault(TaskError::Session("connection reset".into()))
            } else if bad.contains(&item) {
                RunOutcome::TaskFailed(TaskError::App(format!("item {item} rejected")))
            } else {
                RunOutcome::Completed(item)
            };
            (driver, outcome)
        })
    })
}

#[tokio::test]
async fn results_come_back_in_submission_order() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(created, quits)).unwrap();

    // 30ms finishes last even though it was submitted first
    let results = pool.execute(sleepy_task(), vec![30, 0, 10]).await.unwrap();
    let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values, vec![300, 0, 100]);
}

#[tokio::test]
async fn concurrency_is_capped_at_pool_size() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(Arc::clone(&created), quits)).unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let task: PoolTask<FakeDriver, u64, u64> = {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        Arc::new(move |driver, item| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            Box::pin(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                (driver, RunOutcome::Completed(item))
            })
        })
    };

    let results = pool.execute(task, (0..6).collect()).await.unwrap();
    assert_eq!(results.len(), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    // only as many sessions as could ever run at once
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sessions_are_capped_by_item_count() {
    let (created, quits) = counters();
    let pool = DriverPool::new(4, provider(Arc::clone(&created), quits)).unwrap();

    pool.execute(sleepy_task(), vec![1]).await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(pool.session_count().await, 1);
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(Arc::clone(&created), quits)).unwrap();

    let results = pool.execute(sleepy_task(), Vec::new()).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn item_failure_does_not_poison_the_run() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(Arc::clone(&created), Arc::clone(&quits))).unwrap();

    let results = pool
        .execute(flaky_task(vec![2], Vec::new()), vec![1, 2, 3])
        .await
        .unwrap();

    assert_eq!(*results[0].as_ref().unwrap(), 1);
    assert!(matches!(results[1], Err(TaskError::App(_))));
    assert_eq!(*results[2].as_ref().unwrap(), 3);
    // failed items do not cost sessions
    assert_eq!(quits.load(Ordering::SeqCst), 0);
    assert_eq!(pool.session_count().await, 2);
}

#[tokio::test]
async fn faulted_sessions_are_replaced() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(Arc::clone(&created), Arc::clone(&quits))).unwrap();

    let results = pool
        .execute(flaky_task(Vec::new(), vec![2]), vec![1, 2, 3, 4])
        .await
        .unwrap();

    assert!(matches!(results[1], Err(TaskError::Session(_))));
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    // one retirement, one replacement on top of the initial fill
    assert_eq!(quits.load(Ordering::SeqCst), 1);
    assert_eq!(created.load(Ordering::SeqCst), 3);
    assert_eq!(pool.session_count().await, 2);
}

#[tokio::test]
async fn replacement_failure_aborts_the_run_under_fail_fast() {
    let (created, quits) = counters();
    // enough for the initial fill, nothing for replacements
    let pool = DriverPool::new(2, limited_provider(created, quits, 2)).unwrap();

    let err = pool
        .execute(flaky_task(Vec::new(), vec![1]), vec![1, 2, 3])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Driver(_)));
}

#[tokio::test]
async fn degrade_policy_shrinks_capacity_instead_of_aborting() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, limited_provider(Arc::clone(&created), Arc::clone(&quits), 2))
        .unwrap()
        .with_policy(ReplacementPolicy::Degrade);

    // the fault costs a session; its replacement fails, so the run finishes
    // on the surviving session
    let results = pool
        .execute(flaky_task(Vec::new(), vec![2]), vec![1, 2, 3, 4])
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(pool.capacity().await, 1);
    assert_eq!(quits.load(Ordering::SeqCst), 1);

    // losing the last slot aborts
    let err = pool
        .execute(flaky_task(Vec::new(), vec![1]), vec![1, 2])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NoSessions));
    assert_eq!(pool.capacity().await, 0);
}

#[tokio::test]
async fn zero_size_pool_is_rejected() {
    let (created, quits) = counters();
    let err = DriverPool::new(0, provider(created, quits)).unwrap_err();
    assert!(matches!(err, PoolError::InvalidSize));
}

#[tokio::test]
async fn close_quits_sessions_and_rejects_further_runs() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(Arc::clone(&created), Arc::clone(&quits))).unwrap();

    pool.execute(sleepy_task(), vec![1, 2, 3]).await.unwrap();
    assert_eq!(pool.session_count().await, 2);

    pool.close().await.unwrap();
    assert_eq!(quits.load(Ordering::SeqCst), 2);

    let err = pool.execute(sleepy_task(), vec![1]).await.unwrap_err();
    assert!(matches!(err, PoolError::Closed));

    // close is idempotent
    pool.close().await.unwrap();
    assert_eq!(quits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn streaming_run_locks_out_blocking_runs() {
    let (created, quits) = counters();
    let pool = DriverPool::new(1, provider(created, quits)).unwrap();

    let handle = pool.execute_async(sleepy_task(), Vec::new(), None).await.unwrap();
    let err = pool.execute(sleepy_task(), vec![1]).await.unwrap_err();
    assert!(matches!(err, PoolError::AlreadyRunning));

    handle.join().await.unwrap();
    pool.execute(sleepy_task(), vec![1]).await.unwrap();
}

#[tokio::test]
async fn streaming_drains_queued_items_after_stop() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(created, quits)).unwrap();

    let handle = pool.execute_async(sleepy_task(), vec![5], None).await.unwrap();
    handle.add_all(vec![1, 3]).unwrap();
    handle.stop();

    // intake is closed, queued items still run
    assert!(matches!(handle.add(7), Err(PoolError::Closed)));

    let mut values: Vec<u64> = handle
        .results()
        .map(|r| r.unwrap())
        .collect::<Vec<_>>()
        .await;
    values.sort_unstable();
    assert_eq!(values, vec![10, 30, 50]);

    handle.join().await.unwrap();
}

#[tokio::test]
async fn streaming_results_arrive_while_the_run_is_open() {
    let (created, quits) = counters();
    let pool = DriverPool::new(1, provider(created, quits)).unwrap();

    let handle = pool.execute_async(sleepy_task(), vec![1], None).await.unwrap();
    let first = handle.next_result().await.unwrap().unwrap();
    assert_eq!(first, 10);

    // the run is still accepting after a result was consumed
    handle.add(2).unwrap();
    let second = handle.next_result().await.unwrap().unwrap();
    assert_eq!(second, 20);

    handle.join().await.unwrap();
}

#[tokio::test]
async fn streaming_invokes_the_result_callback() {
    let (created, quits) = counters();
    let pool = DriverPool::new(2, provider(created, quits)).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let on_result = {
        let seen = Arc::clone(&seen);
        Arc::new(move |result: &Result<u64, TaskError>| {
            assert!(result.is_ok());
            seen.fetch_add(1, Ordering::SeqCst);
        }) as corral_pool::ResultCallback<u64>
    };

    let handle = pool
        .execute_async(sleepy_task(), vec![1, 2, 3], Some(on_result))
        .await
        .unwrap();
    handle.join().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn streaming_faults_replace_sessions_too() {
    let (created, quits) = counters();
    let pool = DriverPool::new(1, provider(Arc::clone(&created), Arc::clone(&quits))).unwrap();

    let handle = pool
        .execute_async(flaky_task(Vec::new(), vec![2]), vec![1, 2, 3], None)
        .await
        .unwrap();
    handle.stop();

    let results: Vec<Result<u64, TaskError>> = handle.results().collect().await;
    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    handle.join().await.unwrap();

    assert_eq!(quits.load(Ordering::SeqCst), 1);
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn streaming_surfaces_fatal_errors_on_join() {
    let (created, quits) = counters();
    let pool = DriverPool::new(1, limited_provider(created, quits, 1)).unwrap();

    let handle = pool
        .execute_async(flaky_task(Vec::new(), vec![1]), vec![1], None)
        .await
        .unwrap();

    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, PoolError::Driver(_)));
}

#[derive(Default)]
struct FakeSidecar {
    quits: AtomicUsize,
}

#[async_trait::async_trait]
impl corral_pool::Sidecar for FakeSidecar {
    async fn quit(&self) -> Result<(), DriverError> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn close_tears_down_the_sidecar() {
    let (created, quits) = counters();
    let sidecar = Arc::new(FakeSidecar::default());
    let pool = DriverPool::new(1, provider(created, quits))
        .unwrap()
        .with_sidecar(Arc::clone(&sidecar) as Arc<dyn corral_pool::Sidecar>);

    pool.close().await.unwrap();
    assert_eq!(sidecar.quits.load(Ordering::SeqCst), 1);
}
