// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tracking which upkeeps are in flight, so that they are not reported twice.
//!
//! When a report is accepted, each of its upkeeps becomes blocked: no node samples or
//! reports it again until a perform log (or a stale-report log) shows what happened on
//! chain. The blocking state of an upkeep is an [`IdBlocker`] that only ever moves forward,
//! so logs can be processed in any order and on any node with the same outcome.

#[cfg(test)]
#[path = "unit_tests/coordinator_tests.rs"]
mod unit_tests;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use keepers_base::{
    cache::{CacheCleaner, Expiration, TtlCache},
    data_types::PerformLog,
    identifiers::{BlockKey, UpkeepIdentifier, UpkeepKey},
    time::{timer, Duration, Instant},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    environment::Environment,
    interfaces::{PerformLogProvider as _, ProviderError},
};

/// How long the accept and confirmation state of a key is remembered.
pub const ACTIVE_KEY_TTL: Duration = Duration::from_secs(60 * 60);

#[cfg(with_metrics)]
mod metrics {
    use std::sync::LazyLock;

    use keepers_base::prometheus_util::{register_int_counter, register_int_counter_vec};
    use prometheus::{IntCounter, IntCounterVec};

    pub static KEYS_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter("keys_accepted", "Upkeep keys accepted for transmission")
    });

    pub static TRANSMISSIONS_CONFIRMED: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec(
            "transmissions_confirmed",
            "Accepted upkeep keys resolved by an on-chain log",
            &["log_kind"],
        )
    });
}

/// Until when an upkeep is blocked from being sampled or reported again.
///
/// Keys of the upkeep at blocks up to and including `transmit_block` are blocked. While
/// the outcome of an accepted report is unknown, `transmit_block` is
/// [`BlockKey::INDEFINITE`].
#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash, Serialize, Deserialize)]
pub struct IdBlocker {
    pub check_block: BlockKey,
    pub transmit_block: BlockKey,
}

impl IdBlocker {
    /// The position of this blocker in the order in which blockers supersede each other.
    ///
    /// An indefinite transmit block ranks below every real one at the same check block.
    fn rank(&self) -> (BlockKey, Option<BlockKey>) {
        (self.check_block, self.transmit_block.as_finite())
    }

    /// Whether `new` supersedes `self`: it is for a later check block, or for the same
    /// check block and a later real transmit block.
    ///
    /// This is a strict total order on ranks, so merging any set of blockers by keeping
    /// the superseding one reaches the same state whatever the order.
    pub fn should_update(&self, new: &IdBlocker) -> bool {
        new.rank() > self.rank()
    }

    /// Whether this blocker lets `key` through.
    pub fn allows(&self, key: &UpkeepKey) -> bool {
        key.block.after(&self.transmit_block)
    }
}

/// The kind of on-chain log resolving an accepted key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LogKind {
    Perform,
    Stale,
}

impl LogKind {
    fn as_str(&self) -> &'static str {
        match self {
            LogKind::Perform => "perform",
            LogKind::Stale => "stale",
        }
    }
}

struct CoordinatorState<Env: Environment> {
    environment: Arc<Env>,
    id_blocks: Arc<TtlCache<UpkeepIdentifier, IdBlocker>>,
    /// Whether the transmission of each accepted key has been confirmed.
    active_keys: Arc<TtlCache<UpkeepKey, bool>>,
    min_confirmations: i64,
}

impl<Env: Environment> CoordinatorState<Env> {
    fn update_id_block(&self, identifier: &UpkeepIdentifier, blocker: IdBlocker) -> bool {
        self.id_blocks
            .update(identifier.clone(), Expiration::Default, |current| match current {
                Some(current) if !current.should_update(&blocker) => None,
                _ => Some(blocker),
            })
    }

    fn accept(&self, key: &UpkeepKey) -> bool {
        let newly_active = self
            .active_keys
            .update(key.clone(), Expiration::Default, |current| {
                current.is_none().then_some(false)
            });
        if newly_active {
            self.update_id_block(
                &key.identifier,
                IdBlocker {
                    check_block: key.block,
                    transmit_block: BlockKey::INDEFINITE,
                },
            );
        }
        newly_active
    }

    fn handle_log(&self, log: &PerformLog, kind: LogKind) {
        if log.confirmations < self.min_confirmations {
            return;
        }
        let transmit_block = match kind {
            LogKind::Perform => log.transmit_block,
            LogKind::Stale => match log.key.block.next() {
                Ok(next) => next,
                Err(error) => {
                    warn!(key = %log.key, %error, "ignoring stale report log");
                    return;
                }
            },
        };
        let blocker = IdBlocker {
            check_block: log.key.block,
            transmit_block,
        };
        let confirmed_now = self
            .active_keys
            .update(log.key.clone(), Expiration::Default, |current| {
                (current == Some(&false)).then_some(true)
            });
        if confirmed_now {
            #[cfg(with_metrics)]
            metrics::TRANSMISSIONS_CONFIRMED
                .with_label_values(&[kind.as_str()])
                .inc();
            debug!(key = %log.key, %transmit_block, kind = kind.as_str(), "transmission confirmed");
            self.update_id_block(&log.key.identifier, blocker);
            return;
        }
        if self.active_keys.get(&log.key) != Some(true) {
            return;
        }
        // The key was already confirmed: a different transmit block for the same check
        // means the transaction was reorganized into another block.
        let Some(current) = self.id_blocks.get(&log.key.identifier) else {
            return;
        };
        if current.check_block == blocker.check_block
            && current.transmit_block != blocker.transmit_block
            && self.update_id_block(&log.key.identifier, blocker)
        {
            debug!(
                key = %log.key,
                from = %current.transmit_block,
                to = %transmit_block,
                kind = kind.as_str(),
                "transmit block moved"
            );
        }
    }

    async fn check_logs(&self) -> Result<(), ProviderError> {
        let perform_logs = self.environment.logs().perform_logs().await?;
        for log in &perform_logs {
            self.handle_log(log, LogKind::Perform);
        }
        let stale_logs = self.environment.logs().stale_report_logs().await?;
        for log in &stale_logs {
            self.handle_log(log, LogKind::Stale);
        }
        trace!(
            perform = perform_logs.len(),
            stale = stale_logs.len(),
            "processed logs"
        );
        Ok(())
    }

    async fn run(self: Arc<Self>, interval: Duration, cancellation: CancellationToken) {
        loop {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                result = self.check_logs() => result,
            };
            if let Err(error) = result {
                warn!(%error, "failed to read perform logs");
            }
            let elapsed = started.elapsed();
            if elapsed >= interval {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = interval.as_millis() as u64,
                    "log polling took longer than its interval"
                );
                if cancellation.is_cancelled() {
                    break;
                }
                continue;
            }
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = timer::sleep(interval - elapsed) => {}
            }
        }
        debug!("report coordinator stopped");
    }
}

/// Keeps track of the keys accepted for transmission and of their on-chain outcome.
pub struct ReportCoordinator<Env: Environment> {
    state: Arc<CoordinatorState<Env>>,
    poll_interval: Duration,
    cleaners: [CacheCleaner; 2],
    started: AtomicBool,
    cancellation: CancellationToken,
}

impl<Env: Environment> ReportCoordinator<Env> {
    /// Creates a coordinator. Upkeeps stay blocked for at most `lockout_window` after they
    /// were last updated. Must be called within a Tokio runtime.
    pub fn new(
        environment: Arc<Env>,
        lockout_window: Duration,
        min_confirmations: i64,
        poll_interval: Duration,
        eviction_interval: Duration,
    ) -> Self {
        let id_blocks = Arc::new(TtlCache::new(lockout_window));
        let active_keys = Arc::new(TtlCache::new(ACTIVE_KEY_TTL));
        let cleaners = [
            CacheCleaner::spawn(&id_blocks, eviction_interval),
            CacheCleaner::spawn(&active_keys, eviction_interval),
        ];
        let state = Arc::new(CoordinatorState {
            environment,
            id_blocks,
            active_keys,
            min_confirmations,
        });
        ReportCoordinator {
            state,
            poll_interval,
            cleaners,
            started: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        }
    }

    /// Starts polling logs. Only the first call has an effect.
    pub fn start(&self) {
        if self.cancellation.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(
            self.state
                .clone()
                .run(self.poll_interval, self.cancellation.clone()),
        );
    }

    /// Stops polling logs and sweeping the caches. Idempotent.
    pub fn stop(&self) {
        self.cancellation.cancel();
        for cleaner in &self.cleaners {
            cleaner.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Records that `key` was included in an accepted report, blocking its upkeep.
    ///
    /// Accepting a key that is already active has no effect.
    #[instrument(level = "trace", skip(self), fields(key = %key))]
    pub fn accept(&self, key: &UpkeepKey) {
        if self.state.accept(key) {
            #[cfg(with_metrics)]
            metrics::KEYS_ACCEPTED.inc();
            debug!("key accepted");
        }
    }

    /// Returns a predicate keeping only the keys whose upkeep is not blocked.
    pub fn filter(&self) -> impl Fn(&UpkeepKey) -> bool + Send + Sync + 'static {
        let id_blocks = self.state.id_blocks.clone();
        move |key| {
            id_blocks
                .get(&key.identifier)
                .map_or(true, |blocker| blocker.allows(key))
        }
    }

    /// Returns `false` only while `key` is accepted and no log has confirmed it yet.
    pub fn is_transmission_confirmed(&self, key: &UpkeepKey) -> bool {
        self.state.active_keys.get(key).unwrap_or(true)
    }

    /// Returns whether `key` is accepted and not yet confirmed.
    pub fn is_pending(&self, key: &UpkeepKey) -> bool {
        self.state.active_keys.get(key) == Some(false)
    }

    pub fn id_blocker(&self, identifier: &UpkeepIdentifier) -> Option<IdBlocker> {
        self.state.id_blocks.get(identifier)
    }

    /// Reads and applies the current logs once, outside of the polling loop.
    pub async fn poll_logs(&self) -> Result<(), ProviderError> {
        self.state.check_logs().await
    }
}

impl<Env: Environment> Drop for ReportCoordinator<Env> {
    fn drop(&mut self) {
        self.stop();
    }
}
