// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use assert_matches::assert_matches;
use futures::FutureExt as _;
use keepers_base::time::{timer, Duration, Instant};
use tokio::sync::Notify;

use super::{Job, WorkerPool, WorkerPoolError};
use crate::interfaces::ProviderError;

fn job<T: Send + 'static>(
    future: impl std::future::Future<Output = Result<T, ProviderError>> + Send + 'static,
) -> Job<T> {
    future.boxed()
}

/// Tests that failing jobs are counted without affecting their siblings.
#[test_log::test(tokio::test)]
async fn test_partial_failures_are_aggregated() {
    let pool = WorkerPool::<u32>::new(4, 16);
    let jobs = (0..10u32).map(|i| {
        job(async move {
            if i % 3 == 0 {
                Err(ProviderError::Rpc(format!("failure {i}")))
            } else {
                Ok(i)
            }
        })
    });

    let results = pool.run_group(jobs).await.unwrap();

    assert_eq!(results.total, 10);
    assert_eq!(results.failures, 4);
    assert!(!results.all_failed());
    let mut successes = results.successes;
    successes.sort();
    assert_eq!(successes, vec![1, 2, 4, 5, 7, 8]);
    assert_matches!(results.last_error, Some(ProviderError::Rpc(_)));
}

/// Tests the aggregate of a group in which every job failed.
#[tokio::test]
async fn test_all_jobs_failing() {
    let pool = WorkerPool::<u32>::new(2, 2);
    let jobs = (0..3).map(|_| job(async { Err(ProviderError::Rpc("down".into())) }));

    let results = pool.run_group(jobs).await.unwrap();

    assert!(results.all_failed());
    assert_eq!(results.failures, 3);
    assert_eq!(
        results.last_error,
        Some(ProviderError::Rpc("down".to_owned()))
    );
}

/// Tests that an empty group is not reported as a failure.
#[tokio::test]
async fn test_empty_group() {
    let pool = WorkerPool::<u32>::new(2, 2);
    let results = pool.run_group(Vec::new()).await.unwrap();
    assert_eq!(results.total, 0);
    assert!(!results.all_failed());
}

/// Tests that no more than `max_workers` jobs run at the same time.
#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    const MAX_WORKERS: usize = 3;
    let pool = WorkerPool::<()>::new(MAX_WORKERS, 100);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let jobs = (0..20).map(|_| {
        let running = running.clone();
        let peak = peak.clone();
        job(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            timer::sleep(Duration::from_millis(10)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    });

    let results = pool.run_group(jobs).await.unwrap();

    assert_eq!(results.successes.len(), 20);
    assert_eq!(peak.load(Ordering::SeqCst), MAX_WORKERS);
}

/// Tests that submitting waits once the queue is full.
#[tokio::test(start_paused = true)]
async fn test_full_queue_applies_backpressure() {
    let pool = WorkerPool::<()>::new(1, 1);
    let release = Arc::new(Notify::new());

    let blocked = |release: Arc<Notify>| {
        job(async move {
            release.notified().await;
            Ok(())
        })
    };

    // One job runs, one waits in the dispatcher for a worker, one waits in the queue.
    let mut receivers = Vec::new();
    for _ in 0..3 {
        receivers.push(pool.submit(blocked(release.clone())).await.unwrap());
        tokio::task::yield_now().await;
    }

    let fourth = timer::timeout(
        Duration::from_secs(1),
        pool.submit(blocked(release.clone())),
    )
    .await;
    assert!(fourth.is_err(), "submission should wait for room in the queue");

    release.notify_waiters();
    tokio::task::yield_now().await;
    let fourth = timer::timeout(
        Duration::from_secs(1),
        pool.submit(job(async { Ok(()) })),
    )
    .await;
    assert!(fourth.is_ok());
}

/// Tests that stopping the pool cancels running jobs and rejects new ones.
#[tokio::test(start_paused = true)]
async fn test_stop_cancels_jobs() {
    let pool = WorkerPool::<()>::new(1, 4);
    let receiver = pool
        .submit(job(async {
            timer::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }))
        .await
        .unwrap();
    tokio::task::yield_now().await;

    pool.stop();
    pool.stop();

    assert!(pool.is_stopped());
    let outcome = receiver.await.unwrap_or(Err(ProviderError::Cancelled));
    assert_eq!(outcome, Err(ProviderError::Cancelled));
    assert_matches!(
        pool.submit(job(async { Ok(()) })).await,
        Err(WorkerPoolError::Stopped)
    );
}

/// Tests that dropping a group before it completes frees the workers it was holding.
#[test_log::test(tokio::test(start_paused = true))]
async fn test_abandoned_group_is_cancelled() {
    let pool = WorkerPool::<u32>::new(1, 16);
    let started = Arc::new(AtomicUsize::new(0));
    let slow_jobs = (0..4).map(|i| {
        let started = started.clone();
        job(async move {
            started.fetch_add(1, Ordering::SeqCst);
            timer::sleep(Duration::from_secs(5)).await;
            Ok(i)
        })
    });

    let abandoned = timer::timeout(Duration::from_secs(1), pool.run_group(slow_jobs)).await;
    assert!(abandoned.is_err());
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let begin = Instant::now();
    let results = pool.run_group([job(async { Ok(7) })]).await.unwrap();
    assert_eq!(results.successes, vec![7]);
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert_eq!(started.load(Ordering::SeqCst), 1);
}
