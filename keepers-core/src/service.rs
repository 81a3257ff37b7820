// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Checking upkeeps against the registry.
//!
//! On every new chain head, the [`UpkeepService`] checks a random sample of the active
//! upkeeps and keeps the outcome as the latest snapshot, which observations are made
//! from. It also checks arbitrary keys on demand when a report is built. Check results
//! are cached per key, and registry calls are batched and run on a bounded worker pool.

#[cfg(test)]
#[path = "unit_tests/service_tests.rs"]
mod unit_tests;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures::{FutureExt as _, StreamExt as _};
use itertools::Itertools as _;
use keepers_base::{
    cache::{CacheCleaner, Expiration, TtlCache},
    data_types::UpkeepResult,
    identifiers::{BlockKey, UpkeepKey},
    time::{timer, Duration, Instant},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::KeepersConfig,
    environment::Environment,
    interfaces::{HeadSubscriber as _, ProviderError, Registry as _},
    sampling::{shuffle_with_entropy, SampleRatio},
    worker_pool::{Job, WorkerPool, WorkerPoolError},
};

#[cfg(with_metrics)]
mod metrics {
    use std::sync::LazyLock;

    use keepers_base::prometheus_util::{
        exponential_bucket_latencies, register_histogram_vec, register_int_counter,
        register_int_counter_vec,
    };
    use prometheus::{HistogramVec, IntCounter, IntCounterVec};

    pub static UPKEEPS_SAMPLED: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter("upkeeps_sampled", "Upkeeps checked when sampling a head")
    });

    pub static UPKEEP_CHECK_BATCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec(
            "upkeep_check_batches",
            "Batches of upkeep keys sent to the registry",
            &["outcome"],
        )
    });

    pub static SAMPLING_LATENCY_MS: LazyLock<HistogramVec> = LazyLock::new(|| {
        register_histogram_vec(
            "sampling_latency_ms",
            "Time to sample and check the upkeeps of a head",
            &[],
            exponential_bucket_latencies(10_000.0),
        )
    });
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No head has been sampled yet")]
    SamplingNotInitialized,
    #[error("All {failures} check batches failed, the last one with: {last}")]
    TooManyErrors { failures: usize, last: ProviderError },
    #[error(transparent)]
    WorkerPool(#[from] WorkerPoolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// The latest sample, replaced wholesale on every head.
#[derive(Default)]
pub struct SamplingResults {
    latest: Mutex<Option<(BlockKey, Vec<UpkeepResult>)>>,
}

impl SamplingResults {
    pub fn set(&self, head: BlockKey, results: Vec<UpkeepResult>) {
        *self.latest.lock().unwrap() = Some((head, results));
    }

    pub fn get(&self) -> Option<(BlockKey, Vec<UpkeepResult>)> {
        self.latest.lock().unwrap().clone()
    }
}

struct ServiceState<Env: Environment> {
    environment: Arc<Env>,
    ratio: SampleRatio,
    cache: Arc<TtlCache<UpkeepKey, UpkeepResult>>,
    pool: WorkerPool<Vec<UpkeepResult>>,
    samples: SamplingResults,
    check_batch_size: usize,
    sampling_job_duration: Duration,
}

impl<Env: Environment> ServiceState<Env> {
    async fn check_upkeep(&self, keys: &[UpkeepKey]) -> Result<Vec<UpkeepResult>, ServiceError> {
        let mut found = HashMap::new();
        let mut misses = Vec::new();
        for key in keys {
            match self.cache.get(key) {
                Some(result) => {
                    found.insert(key.clone(), result);
                }
                None => misses.push(key.clone()),
            }
        }
        let misses = misses.into_iter().unique().collect::<Vec<_>>();
        trace!(hits = found.len(), misses = misses.len(), "looked up check results");

        if !misses.is_empty() {
            let jobs = misses
                .chunks(self.check_batch_size.max(1))
                .map(|batch| {
                    let environment = self.environment.clone();
                    let batch = batch.to_vec();
                    let job: Job<Vec<UpkeepResult>> = async move {
                        environment.registry().check_upkeep(&batch).await
                    }
                    .boxed();
                    job
                })
                .collect::<Vec<_>>();
            let outcome = self.pool.run_group(jobs).await?;
            #[cfg(with_metrics)]
            {
                let successes = (outcome.total - outcome.failures) as u64;
                metrics::UPKEEP_CHECK_BATCHES
                    .with_label_values(&["success"])
                    .inc_by(successes);
                metrics::UPKEEP_CHECK_BATCHES
                    .with_label_values(&["failure"])
                    .inc_by(outcome.failures as u64);
            }
            if outcome.all_failed() {
                let last = outcome.last_error.unwrap_or(ProviderError::Cancelled);
                return Err(ServiceError::TooManyErrors {
                    failures: outcome.failures,
                    last,
                });
            }
            if let Some(error) = &outcome.last_error {
                warn!(
                    failures = outcome.failures,
                    total = outcome.total,
                    %error,
                    "some check batches failed"
                );
            }
            for result in outcome.successes.into_iter().flatten() {
                self.cache
                    .set(result.key.clone(), result.clone(), Expiration::Default);
                found.insert(result.key.clone(), result);
            }
        }

        Ok(keys
            .iter()
            .filter_map(|key| found.get(key).cloned())
            .collect())
    }

    async fn sample(&self, head: BlockKey) -> Result<usize, ServiceError> {
        let mut identifiers = self.environment.registry().get_active_upkeep_ids().await?;
        shuffle_with_entropy(&mut identifiers);
        identifiers.truncate(self.ratio.of_int(identifiers.len()));
        let keys = identifiers
            .into_iter()
            .map(|identifier| UpkeepKey::new(head, identifier))
            .collect::<Vec<_>>();
        let results = self.check_upkeep(&keys).await?;
        let sampled = results.len();
        self.samples.set(head, results);
        #[cfg(with_metrics)]
        metrics::UPKEEPS_SAMPLED.inc_by(keys.len() as u64);
        Ok(sampled)
    }

    #[instrument(level = "debug", skip_all, fields(%head))]
    async fn process_head(&self, head: BlockKey) {
        let started = Instant::now();
        match timer::timeout(self.sampling_job_duration, self.sample(head)).await {
            Ok(Ok(sampled)) => {
                debug!(
                    sampled,
                    completion_ms = started.elapsed().as_millis() as u64,
                    "sampled head"
                );
            }
            Ok(Err(error)) => warn!(%error, "failed to sample head"),
            Err(_) => warn!(
                timeout_ms = self.sampling_job_duration.as_millis() as u64,
                "sampling did not complete in time, keeping the previous sample"
            ),
        }
        #[cfg(with_metrics)]
        metrics::SAMPLING_LATENCY_MS
            .with_label_values(&[])
            .observe(started.elapsed().as_secs_f64() * 1000.0);
    }

    async fn run(self: Arc<Self>, cancellation: CancellationToken) {
        let mut heads = self.environment.heads().head_ticker();
        loop {
            let head = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                head = heads.next() => match head {
                    Some(head) => head,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                () = self.process_head(head) => {}
            }
        }
        debug!("upkeep service stopped");
    }
}

/// Samples upkeeps on every head and checks keys on demand.
pub struct UpkeepService<Env: Environment> {
    state: Arc<ServiceState<Env>>,
    cleaner: CacheCleaner,
    started: AtomicBool,
    cancellation: CancellationToken,
}

impl<Env: Environment> UpkeepService<Env> {
    /// Creates a service checking `ratio` of the active upkeeps on every head, giving up
    /// on a head after `sampling_job_duration`. Must be called within a Tokio runtime.
    pub fn new(
        environment: Arc<Env>,
        ratio: SampleRatio,
        sampling_job_duration: Duration,
        config: &KeepersConfig,
    ) -> Self {
        let cache = Arc::new(TtlCache::new(config.cache_expiration()));
        let cleaner = CacheCleaner::spawn(&cache, config.cache_eviction_interval());
        let pool = WorkerPool::new(config.max_service_workers(), config.service_queue_length);
        let state = Arc::new(ServiceState {
            environment,
            ratio,
            cache,
            pool,
            samples: SamplingResults::default(),
            check_batch_size: config.check_batch_size,
            sampling_job_duration,
        });
        UpkeepService {
            state,
            cleaner,
            started: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        }
    }

    /// Subscribes to chain heads. Only the first call has an effect.
    pub fn start(&self) {
        if self.cancellation.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(self.state.clone().run(self.cancellation.clone()));
    }

    /// Stops sampling, cancels pending checks and stops sweeping the cache. Idempotent.
    pub fn stop(&self) {
        self.cancellation.cancel();
        self.cleaner.stop();
        self.state.pool.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn ratio(&self) -> SampleRatio {
        self.state.ratio
    }

    /// Returns the head of the latest sample and its eligible results that pass every
    /// filter.
    pub fn sample_upkeeps(
        &self,
        filters: &[&dyn Fn(&UpkeepKey) -> bool],
    ) -> Result<(BlockKey, Vec<UpkeepResult>), ServiceError> {
        let (head, results) = self
            .state
            .samples
            .get()
            .ok_or(ServiceError::SamplingNotInitialized)?;
        let results = results
            .into_iter()
            .filter(|result| result.is_eligible())
            .filter(|result| filters.iter().all(|filter| filter(&result.key)))
            .collect();
        Ok((head, results))
    }

    /// Returns the latest sample as stored, including results that are not eligible.
    pub fn latest_snapshot(&self) -> Option<(BlockKey, Vec<UpkeepResult>)> {
        self.state.samples.get()
    }

    /// Checks `keys`, using cached results where possible.
    ///
    /// Results come back in the order of `keys`. Keys whose batch failed are left out;
    /// the call only fails if every batch failed.
    pub async fn check_upkeep(
        &self,
        keys: &[UpkeepKey],
    ) -> Result<Vec<UpkeepResult>, ServiceError> {
        self.state.check_upkeep(keys).await
    }

    /// Samples `head` immediately, outside of the head subscription.
    pub async fn sample_head(&self, head: BlockKey) {
        self.state.process_head(head).await
    }
}

impl<Env: Environment> Drop for UpkeepService<Env> {
    fn drop(&mut self) {
        self.stop();
    }
}
