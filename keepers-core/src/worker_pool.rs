// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A pool running jobs with bounded concurrency behind a bounded queue.
//!
//! Submitting waits while the queue is full, so producers slow down instead of the queue
//! growing without limit. A failing job never affects its siblings: the outcome of a group
//! of jobs is aggregated into a [`JobResults`]. Dropping a group before it completes
//! abandons the jobs it still has queued or running.

#[cfg(test)]
#[path = "unit_tests/worker_pool_tests.rs"]
mod unit_tests;

use std::{future::Future, pin::Pin, sync::Arc};

use futures::stream::{FuturesUnordered, StreamExt as _};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::interfaces::ProviderError;

/// A unit of work run by the pool.
pub type Job<T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'static>>;

/// The errors of the [`WorkerPool`] itself, as opposed to the errors of its jobs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WorkerPoolError {
    #[error("The worker pool has been stopped")]
    Stopped,
}

struct QueuedJob<T> {
    job: Job<T>,
    /// Cancelled when nobody waits for the job anymore.
    group: CancellationToken,
    respond_to: oneshot::Sender<Result<T, ProviderError>>,
}

/// The aggregated outcome of a group of jobs.
#[derive(Debug)]
pub struct JobResults<T> {
    /// The number of jobs in the group.
    pub total: usize,
    /// The values of the jobs that succeeded, in completion order.
    pub successes: Vec<T>,
    /// The number of jobs that failed.
    pub failures: usize,
    /// The error of the last job that failed.
    pub last_error: Option<ProviderError>,
}

impl<T> Default for JobResults<T> {
    fn default() -> Self {
        JobResults {
            total: 0,
            successes: Vec::new(),
            failures: 0,
            last_error: None,
        }
    }
}

impl<T> JobResults<T> {
    fn record(&mut self, result: Result<T, ProviderError>) {
        match result {
            Ok(value) => self.successes.push(value),
            Err(error) => {
                self.failures += 1;
                self.last_error = Some(error);
            }
        }
    }

    /// Whether at least one job ran and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.successes.is_empty()
    }
}

/// Runs jobs on at most `max_workers` concurrent tasks.
pub struct WorkerPool<T> {
    queue: mpsc::Sender<QueuedJob<T>>,
    cancellation: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool and spawns its dispatcher. Must be called within a Tokio runtime.
    ///
    /// At most `queue_length` jobs wait for a worker at any time. Both values are raised
    /// to one if zero.
    pub fn new(max_workers: usize, queue_length: usize) -> Self {
        let (queue, receiver) = mpsc::channel(queue_length.max(1));
        let cancellation = CancellationToken::new();
        let workers = Arc::new(Semaphore::new(max_workers.max(1)));
        tokio::spawn(Self::dispatch(receiver, workers, cancellation.clone()));
        WorkerPool {
            queue,
            cancellation,
        }
    }

    async fn dispatch(
        mut receiver: mpsc::Receiver<QueuedJob<T>>,
        workers: Arc<Semaphore>,
        cancellation: CancellationToken,
    ) {
        let mut running = JoinSet::new();
        loop {
            let queued = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                queued = receiver.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };
            let permit = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = queued.group.cancelled() => {
                    trace!("skipping a job of an abandoned group");
                    continue;
                }
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while running.try_join_next().is_some() {}
            running.spawn(async move {
                let _permit = permit;
                let QueuedJob {
                    job,
                    group,
                    respond_to,
                } = queued;
                let result = tokio::select! {
                    biased;
                    _ = group.cancelled() => Err(ProviderError::Cancelled),
                    result = job => result,
                };
                if respond_to.send(result).is_err() {
                    trace!("job result was not awaited");
                }
            });
        }
        receiver.close();
        running.abort_all();
        debug!("worker pool dispatcher stopped");
    }

    /// Queues a job, waiting for room in the queue if necessary.
    ///
    /// Returns a receiver for the job's result. The receiver errs if the pool is stopped
    /// before the job completes.
    pub async fn submit(
        &self,
        job: Job<T>,
    ) -> Result<oneshot::Receiver<Result<T, ProviderError>>, WorkerPoolError> {
        self.submit_in_group(job, self.cancellation.child_token()).await
    }

    async fn submit_in_group(
        &self,
        job: Job<T>,
        group: CancellationToken,
    ) -> Result<oneshot::Receiver<Result<T, ProviderError>>, WorkerPoolError> {
        if self.cancellation.is_cancelled() {
            return Err(WorkerPoolError::Stopped);
        }
        let (respond_to, receiver) = oneshot::channel();
        self.queue
            .send(QueuedJob {
                job,
                group,
                respond_to,
            })
            .await
            .map_err(|_| WorkerPoolError::Stopped)?;
        Ok(receiver)
    }

    /// Runs a group of jobs and aggregates their outcomes.
    ///
    /// Jobs cancelled because the pool stopped count as failures. If the returned future
    /// is dropped early, the jobs of the group that have not completed are cancelled.
    pub async fn run_group(
        &self,
        jobs: impl IntoIterator<Item = Job<T>>,
    ) -> Result<JobResults<T>, WorkerPoolError> {
        let group = self.cancellation.child_token();
        let _abandon_on_drop = group.clone().drop_guard();
        let mut results = JobResults::default();
        let mut pending = FuturesUnordered::new();
        for job in jobs {
            pending.push(self.submit_in_group(job, group.clone()).await?);
            results.total += 1;
        }
        while let Some(outcome) = pending.next().await {
            results.record(outcome.unwrap_or(Err(ProviderError::Cancelled)));
        }
        Ok(results)
    }

    /// Stops the pool, cancelling queued and running jobs. Idempotent.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Returns whether the pool has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
