// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The tunables of the plugin.
//!
//! [`OffchainConfig`] is agreed on by every node of the network and arrives with each new
//! configuration. [`KeepersConfig`] holds node-local settings that do not need to match.

#[cfg(test)]
#[path = "unit_tests/config_tests.rs"]
mod unit_tests;

use keepers_base::{ensure, time::Duration};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sampling::SamplingError;

const DEFAULT_TARGET_PROBABILITY: &str = "0.99999";
const DEFAULT_TARGET_IN_ROUNDS: i64 = 1;
const DEFAULT_SAMPLING_JOB_DURATION_MS: i64 = 3_000;
const DEFAULT_PERFORM_LOCKOUT_WINDOW_MS: i64 = 20 * 60 * 1_000;
const DEFAULT_GAS_LIMIT_PER_REPORT: u32 = 5_300_000;
const DEFAULT_GAS_OVERHEAD_PER_UPKEEP: u32 = 300_000;
const DEFAULT_MAX_UPKEEP_BATCH_SIZE: i64 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to decode the off-chain config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid target probability `{0}`")]
    InvalidProbability(String),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error("`{field}` must not be negative")]
    NegativeValue { field: &'static str },
    #[error("`{field}` must not be zero")]
    ZeroValue { field: &'static str },
}

/// The configuration shared by every node, decoded from the off-chain config blob.
///
/// Zero or missing values are replaced by defaults when decoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OffchainConfig {
    /// The probability, as a decimal string, that an eligible upkeep is observed by at
    /// least one node within `target_in_rounds` rounds.
    pub target_probability: String,
    pub target_in_rounds: i64,
    /// Milliseconds.
    pub sampling_job_duration: i64,
    /// Milliseconds.
    pub perform_lockout_window: i64,
    pub min_confirmations: i64,
    pub gas_limit_per_report: u32,
    pub gas_overhead_per_upkeep: u32,
    pub max_upkeep_batch_size: i64,
    pub report_block_lag: i64,
}

impl Default for OffchainConfig {
    fn default() -> Self {
        OffchainConfig {
            target_probability: DEFAULT_TARGET_PROBABILITY.to_owned(),
            target_in_rounds: DEFAULT_TARGET_IN_ROUNDS,
            sampling_job_duration: DEFAULT_SAMPLING_JOB_DURATION_MS,
            perform_lockout_window: DEFAULT_PERFORM_LOCKOUT_WINDOW_MS,
            min_confirmations: 0,
            gas_limit_per_report: DEFAULT_GAS_LIMIT_PER_REPORT,
            gas_overhead_per_upkeep: DEFAULT_GAS_OVERHEAD_PER_UPKEEP,
            max_upkeep_batch_size: DEFAULT_MAX_UPKEEP_BATCH_SIZE,
            report_block_lag: 0,
        }
    }
}

impl OffchainConfig {
    /// Decodes the JSON blob, filling in defaults and validating the result.
    ///
    /// An empty blob yields the default configuration.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        let mut config = if bytes.is_empty() {
            OffchainConfig::default()
        } else {
            serde_json::from_slice::<OffchainConfig>(bytes)?
        };
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn apply_defaults(&mut self) {
        if self.target_probability.is_empty() {
            self.target_probability = DEFAULT_TARGET_PROBABILITY.to_owned();
        }
        if self.target_in_rounds == 0 {
            self.target_in_rounds = DEFAULT_TARGET_IN_ROUNDS;
        }
        if self.sampling_job_duration == 0 {
            self.sampling_job_duration = DEFAULT_SAMPLING_JOB_DURATION_MS;
        }
        if self.perform_lockout_window == 0 {
            self.perform_lockout_window = DEFAULT_PERFORM_LOCKOUT_WINDOW_MS;
        }
        if self.gas_limit_per_report == 0 {
            self.gas_limit_per_report = DEFAULT_GAS_LIMIT_PER_REPORT;
        }
        if self.gas_overhead_per_upkeep == 0 {
            self.gas_overhead_per_upkeep = DEFAULT_GAS_OVERHEAD_PER_UPKEEP;
        }
        if self.max_upkeep_batch_size == 0 {
            self.max_upkeep_batch_size = DEFAULT_MAX_UPKEEP_BATCH_SIZE;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("targetInRounds", self.target_in_rounds),
            ("samplingJobDuration", self.sampling_job_duration),
            ("performLockoutWindow", self.perform_lockout_window),
            ("minConfirmations", self.min_confirmations),
            ("maxUpkeepBatchSize", self.max_upkeep_batch_size),
            ("reportBlockLag", self.report_block_lag),
        ] {
            ensure!(value >= 0, ConfigError::NegativeValue { field });
        }
        self.probability()?;
        Ok(())
    }

    /// Parses the target probability. It must be in `(0, 1]`.
    pub fn probability(&self) -> Result<f64, ConfigError> {
        let invalid = || ConfigError::InvalidProbability(self.target_probability.clone());
        let probability = self
            .target_probability
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid())?;
        ensure!(probability > 0.0 && probability <= 1.0, invalid());
        Ok(probability)
    }

    /// The time budget of one sampling pass.
    pub fn sampling_job_duration(&self) -> Duration {
        Duration::from_millis(self.sampling_job_duration.unsigned_abs())
    }

    /// How long an accepted upkeep stays blocked.
    pub fn perform_lockout_window(&self) -> Duration {
        Duration::from_millis(self.perform_lockout_window.unsigned_abs())
    }

    pub fn min_confirmations(&self) -> i64 {
        self.min_confirmations
    }

    pub fn max_upkeep_batch_size(&self) -> usize {
        usize::try_from(self.max_upkeep_batch_size).unwrap_or(usize::MAX)
    }

    pub fn report_block_lag(&self) -> u64 {
        self.report_block_lag.unsigned_abs()
    }
}

fn default_max_service_workers() -> usize {
    let parallelism = std::thread::available_parallelism().map_or(1, |count| count.get());
    10 * parallelism
}

/// The settings of one node. They do not have to agree across the network.
#[derive(Debug, Clone, PartialEq, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepersConfig {
    /// How long a check result stays cached, in milliseconds.
    #[arg(
        long = "keepers-cache-expiration-ms",
        default_value = "1200000",
        env = "KEEPERS_CACHE_EXPIRATION_MS"
    )]
    pub cache_expiration_ms: u64,

    /// How often expired cache entries are removed, in milliseconds.
    #[arg(
        long = "keepers-cache-eviction-interval-ms",
        default_value = "30000",
        env = "KEEPERS_CACHE_EVICTION_INTERVAL_MS"
    )]
    pub cache_eviction_interval_ms: u64,

    /// The maximum number of concurrent check batches. Defaults to ten per available core.
    #[arg(long = "keepers-max-service-workers", env = "KEEPERS_MAX_SERVICE_WORKERS")]
    pub max_service_workers: Option<usize>,

    /// The number of check batches that may wait for a worker.
    #[arg(
        long = "keepers-service-queue-length",
        default_value = "1000",
        env = "KEEPERS_SERVICE_QUEUE_LENGTH"
    )]
    pub service_queue_length: usize,

    /// The number of keys sent to the registry in one check call.
    #[arg(
        long = "keepers-check-batch-size",
        default_value = "10",
        env = "KEEPERS_CHECK_BATCH_SIZE"
    )]
    pub check_batch_size: usize,

    /// How often perform logs are polled, in milliseconds.
    #[arg(
        long = "keepers-log-poll-interval-ms",
        default_value = "1000",
        env = "KEEPERS_LOG_POLL_INTERVAL_MS"
    )]
    pub log_poll_interval_ms: u64,
}

impl Default for KeepersConfig {
    fn default() -> Self {
        KeepersConfig {
            cache_expiration_ms: 20 * 60 * 1_000,
            cache_eviction_interval_ms: 30_000,
            max_service_workers: None,
            service_queue_length: 1_000,
            check_batch_size: 10,
            log_poll_interval_ms: 1_000,
        }
    }
}

impl KeepersConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("cache_expiration_ms", self.cache_expiration_ms),
            ("cache_eviction_interval_ms", self.cache_eviction_interval_ms),
            ("log_poll_interval_ms", self.log_poll_interval_ms),
        ] {
            ensure!(value > 0, ConfigError::ZeroValue { field });
        }
        for (field, value) in [
            ("max_service_workers", self.max_service_workers()),
            ("service_queue_length", self.service_queue_length),
            ("check_batch_size", self.check_batch_size),
        ] {
            ensure!(value > 0, ConfigError::ZeroValue { field });
        }
        Ok(())
    }

    pub fn cache_expiration(&self) -> Duration {
        Duration::from_millis(self.cache_expiration_ms)
    }

    pub fn cache_eviction_interval(&self) -> Duration {
        Duration::from_millis(self.cache_eviction_interval_ms)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }

    pub fn max_service_workers(&self) -> usize {
        self.max_service_workers.unwrap_or_else(default_max_service_workers)
    }
}
