// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The reporting plugin driving the upkeep service and the report coordinator through
//! the phases of each round.

#[cfg(test)]
#[path = "unit_tests/plugin_tests.rs"]
mod unit_tests;

use std::sync::Arc;

use itertools::Itertools as _;
use keepers_base::{
    data_types::UpkeepResult,
    ensure,
    identifiers::{BlockKey, UpkeepIdentifier, UpkeepKey},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{ConfigError, OffchainConfig},
    coordinator::ReportCoordinator,
    environment::Environment,
    interfaces::{ProviderError, ReportEncoder as _},
    observation::{Observation, ObservationError},
    ocr::{AttributedObservation, ReportTimestamp, ReportingPlugin},
    sampling::shuffle_for_round,
    service::{ServiceError, UpkeepService},
};

#[cfg(with_metrics)]
mod metrics {
    use std::sync::LazyLock;

    use keepers_base::prometheus_util::register_int_counter;
    use prometheus::IntCounter;

    pub static REPORTS_BUILT: LazyLock<IntCounter> =
        LazyLock::new(|| register_int_counter("reports_built", "Non-empty reports built"));
}

/// The maximum size of an encoded observation, in bytes.
pub const MAX_OBSERVATION_LENGTH: usize = 1_000;

/// The maximum size of an encoded report, in bytes.
pub const MAX_REPORT_LENGTH: usize = 10_000;

/// The maximum number of upkeeps in one observation.
pub const OBSERVATION_UPKEEPS_LIMIT: usize = 1;

/// The maximum number of keys checked when building a report.
pub const REPORT_KEYS_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("A report needs at least one observation")]
    NotEnoughInputs,
    #[error("None of the {count} observations could be decoded, the last one failed with: {last}")]
    AllObservationsInvalid {
        count: usize,
        last: ObservationError,
    },
    #[error("The report is not empty but contains no upkeeps")]
    EmptyReport,
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Observation(#[from] ObservationError),
}

/// Returns the median of `blocks`, moved back by `lag` blocks.
///
/// For an even number of blocks, the higher of the two middle ones is used. Every node
/// must make the same choice.
pub fn calculate_median_block(blocks: &[BlockKey], lag: u64) -> Option<BlockKey> {
    let mut sorted = blocks.to_vec();
    sorted.sort();
    let median = sorted.get(sorted.len() / 2)?;
    Some(median.saturating_sub(lag))
}

/// Removes repeated keys, keeping the first occurrence of each.
pub fn dedupe_keys(keys: Vec<UpkeepKey>) -> Vec<UpkeepKey> {
    keys.into_iter().unique().collect()
}

/// Selects the eligible results to perform in one report, in order.
///
/// A result is skipped, rather than ending the selection, when its gas plus
/// `gas_overhead` does not fit in what is left of `gas_limit`. At most `max_batch_size`
/// results are selected.
pub fn pack_report(
    results: Vec<UpkeepResult>,
    gas_limit: u32,
    gas_overhead: u32,
    max_batch_size: usize,
) -> Vec<UpkeepResult> {
    let mut used_gas = 0u64;
    let mut packed = Vec::new();
    for result in results {
        if packed.len() >= max_batch_size {
            break;
        }
        if !result.is_eligible() {
            continue;
        }
        let cost = u64::from(result.execute_gas) + u64::from(gas_overhead);
        if used_gas + cost > u64::from(gas_limit) {
            continue;
        }
        used_gas += cost;
        packed.push(result);
    }
    packed
}

/// One instance of the plugin, for one configuration.
pub struct KeepersPlugin<Env: Environment> {
    environment: Arc<Env>,
    service: Arc<UpkeepService<Env>>,
    coordinator: Arc<ReportCoordinator<Env>>,
    offchain: OffchainConfig,
}

impl<Env: Environment> KeepersPlugin<Env> {
    pub fn new(
        environment: Arc<Env>,
        service: Arc<UpkeepService<Env>>,
        coordinator: Arc<ReportCoordinator<Env>>,
        offchain: OffchainConfig,
    ) -> Self {
        KeepersPlugin {
            environment,
            service,
            coordinator,
            offchain,
        }
    }

    pub fn service(&self) -> &Arc<UpkeepService<Env>> {
        &self.service
    }

    pub fn coordinator(&self) -> &Arc<ReportCoordinator<Env>> {
        &self.coordinator
    }

    pub fn offchain_config(&self) -> &OffchainConfig {
        &self.offchain
    }

    fn make_observation(&self, timestamp: &ReportTimestamp) -> Result<Vec<u8>, PluginError> {
        let filter = self.coordinator.filter();
        let (block_key, results) = self.service.sample_upkeeps(&[&filter])?;
        let mut keys = results
            .into_iter()
            .filter(UpkeepResult::is_eligible)
            .map(|result| result.key)
            .collect::<Vec<_>>();
        keys.sort();
        let mut identifiers = keys
            .into_iter()
            .map(|key| key.identifier)
            .collect::<Vec<UpkeepIdentifier>>();
        shuffle_for_round(timestamp, &mut identifiers);
        identifiers.truncate(OBSERVATION_UPKEEPS_LIMIT);
        let observation = Observation::new(block_key, identifiers);
        let bytes = observation.encode_limited(MAX_OBSERVATION_LENGTH)?;
        debug!(
            %block_key,
            upkeeps = observation.identifiers.len(),
            bytes = bytes.len(),
            "built observation"
        );
        Ok(bytes)
    }

    /// Decodes the observations into a common block and the union of their upkeeps.
    fn aggregate(
        &self,
        observations: &[AttributedObservation],
    ) -> Result<(BlockKey, Vec<UpkeepIdentifier>), PluginError> {
        ensure!(!observations.is_empty(), PluginError::NotEnoughInputs);
        let mut blocks = Vec::with_capacity(observations.len());
        let mut identifiers = Vec::new();
        let mut last_error = None;
        for attributed in observations {
            match Observation::decode(&attributed.observation) {
                Ok(observation) => {
                    blocks.push(observation.block_key);
                    identifiers.extend(observation.identifiers);
                }
                Err(error) => {
                    warn!(observer = attributed.observer.0, %error, "skipping invalid observation");
                    last_error = Some(error);
                }
            }
        }
        let lag = self.offchain.report_block_lag();
        match (calculate_median_block(&blocks, lag), last_error) {
            (Some(block), _) => Ok((block, identifiers)),
            (None, Some(last)) => Err(PluginError::AllObservationsInvalid {
                count: observations.len(),
                last,
            }),
            (None, None) => Err(PluginError::NotEnoughInputs),
        }
    }

    async fn make_report(
        &self,
        timestamp: &ReportTimestamp,
        observations: &[AttributedObservation],
    ) -> Result<Option<Vec<u8>>, PluginError> {
        let (block, identifiers) = self.aggregate(observations)?;
        let filter = self.coordinator.filter();
        let keys = identifiers
            .into_iter()
            .map(|identifier| UpkeepKey::new(block, identifier))
            .filter(|key| filter(key))
            .collect();
        let mut keys = dedupe_keys(keys);
        shuffle_for_round(timestamp, &mut keys);
        keys.truncate(REPORT_KEYS_LIMIT);
        if keys.is_empty() {
            debug!(%block, "no upkeeps to report");
            return Ok(None);
        }

        let results = self.service.check_upkeep(&keys).await?;
        let mut packed = pack_report(
            results,
            self.offchain.gas_limit_per_report,
            self.offchain.gas_overhead_per_upkeep,
            self.offchain.max_upkeep_batch_size(),
        );
        let encoder = self.environment.encoder();
        loop {
            if packed.is_empty() {
                debug!(%block, checked = keys.len(), "no eligible upkeep fits in a report");
                return Ok(None);
            }
            let report = encoder.encode_report(&packed)?;
            if report.len() <= MAX_REPORT_LENGTH {
                #[cfg(with_metrics)]
                metrics::REPORTS_BUILT.inc();
                debug!(%block, upkeeps = packed.len(), bytes = report.len(), "built report");
                return Ok(Some(report));
            }
            packed.pop();
        }
    }
}

impl<Env: Environment> ReportingPlugin for KeepersPlugin<Env> {
    type Error = PluginError;

    async fn query(&self, _timestamp: &ReportTimestamp) -> Result<Vec<u8>, PluginError> {
        Ok(Vec::new())
    }

    #[instrument(skip_all, fields(epoch = timestamp.epoch, round = timestamp.round))]
    async fn observation(
        &self,
        timestamp: &ReportTimestamp,
        _query: &[u8],
    ) -> Result<Vec<u8>, PluginError> {
        let started = Instant::now();
        let observation = self.make_observation(timestamp);
        info!(
            completion_ms = started.elapsed().as_millis() as u64,
            ok = observation.is_ok(),
            "observation phase done"
        );
        observation
    }

    #[instrument(skip_all, fields(epoch = timestamp.epoch, round = timestamp.round))]
    async fn report(
        &self,
        timestamp: &ReportTimestamp,
        _query: &[u8],
        observations: &[AttributedObservation],
    ) -> Result<Option<Vec<u8>>, PluginError> {
        let started = Instant::now();
        let report = self.make_report(timestamp, observations).await;
        info!(
            completion_ms = started.elapsed().as_millis() as u64,
            observations = observations.len(),
            reported = matches!(report, Ok(Some(_))),
            "report phase done"
        );
        report
    }

    #[instrument(skip_all, fields(epoch = timestamp.epoch, round = timestamp.round))]
    async fn should_accept_finalized_report(
        &self,
        timestamp: &ReportTimestamp,
        report: &[u8],
    ) -> Result<bool, PluginError> {
        if report.is_empty() {
            return Ok(false);
        }
        let results = self.environment.encoder().decode_report(report)?;
        ensure!(!results.is_empty(), PluginError::EmptyReport);
        for result in &results {
            self.coordinator.accept(&result.key);
        }
        debug!(upkeeps = results.len(), "accepted report");
        Ok(true)
    }

    #[instrument(skip_all, fields(epoch = timestamp.epoch, round = timestamp.round))]
    async fn should_transmit_accepted_report(
        &self,
        timestamp: &ReportTimestamp,
        report: &[u8],
    ) -> Result<bool, PluginError> {
        if report.is_empty() {
            return Ok(false);
        }
        let results = self.environment.encoder().decode_report(report)?;
        let transmit = results
            .iter()
            .any(|result| !self.coordinator.is_transmission_confirmed(&result.key));
        debug!(transmit, "decided on transmission");
        Ok(transmit)
    }

    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
