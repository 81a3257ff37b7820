// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The contract between the off-chain reporting (OCR2) transport and a reporting plugin.
//!
//! The transport runs rounds made of four phases and calls the plugin in each of them:
//! every oracle makes an [`ReportingPlugin::observation`], the leader aggregates the
//! attributed observations into a [`ReportingPlugin::report`], and every oracle then
//! decides whether to accept and transmit the finalized report.

use std::fmt;

use keepers_base::time::Duration;
use serde::{Deserialize, Serialize};

/// The digest of an OCR2 configuration. All oracles running the same configuration share it.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash, Default, Serialize, Deserialize)]
pub struct ConfigDigest(pub [u8; 32]);

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigDigest({self})")
    }
}

/// Identifies a round of the protocol.
#[derive(Eq, PartialEq, Copy, Clone, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ReportTimestamp {
    pub config_digest: ConfigDigest,
    pub epoch: u32,
    pub round: u8,
}

/// The index of an oracle in the configuration.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash, Debug, Default, Serialize, Deserialize)]
pub struct OracleId(pub u8);

/// An observation, together with the oracle that made it.
#[derive(Eq, PartialEq, Clone, Debug, Serialize, Deserialize)]
pub struct AttributedObservation {
    pub observation: Vec<u8>,
    pub observer: OracleId,
}

/// The size limits the transport enforces on the messages of a plugin.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct ReportingPluginLimits {
    pub max_query_length: usize,
    pub max_observation_length: usize,
    pub max_report_length: usize,
}

/// Static information about a plugin, returned when it is created.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ReportingPluginInfo {
    pub name: String,
    /// Whether several reports may be produced for the same round.
    pub unique_reports: bool,
    pub limits: ReportingPluginLimits,
}

/// The configuration a plugin instance is created from.
#[derive(Clone, Debug)]
pub struct ReportingPluginConfig {
    pub config_digest: ConfigDigest,
    pub oracle_id: OracleId,
    /// The number of oracles.
    pub n: usize,
    /// The maximum number of faulty oracles.
    pub f: usize,
    pub onchain_config: Vec<u8>,
    pub offchain_config: Vec<u8>,
    pub estimated_round_interval: Duration,
    pub max_duration_query: Duration,
    pub max_duration_observation: Duration,
    pub max_duration_report: Duration,
    pub max_duration_should_accept_finalized_report: Duration,
    pub max_duration_should_transmit_accepted_report: Duration,
}

/// The callbacks of one plugin instance.
#[allow(async_fn_in_trait)]
#[trait_variant::make(Send)]
pub trait ReportingPlugin {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the query the leader sends to followers at the start of a round.
    async fn query(&self, timestamp: &ReportTimestamp) -> Result<Vec<u8>, Self::Error>;

    /// Returns this oracle's observation for the round.
    async fn observation(
        &self,
        timestamp: &ReportTimestamp,
        query: &[u8],
    ) -> Result<Vec<u8>, Self::Error>;

    /// Aggregates the observations of a quorum into a report, or [`None`] if there is
    /// nothing to report this round.
    async fn report(
        &self,
        timestamp: &ReportTimestamp,
        query: &[u8],
        observations: &[AttributedObservation],
    ) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Decides whether a report that reached consensus should be accepted.
    async fn should_accept_finalized_report(
        &self,
        timestamp: &ReportTimestamp,
        report: &[u8],
    ) -> Result<bool, Self::Error>;

    /// Decides whether an accepted report still needs to be sent on chain.
    async fn should_transmit_accepted_report(
        &self,
        timestamp: &ReportTimestamp,
        report: &[u8],
    ) -> Result<bool, Self::Error>;

    /// Releases the resources of the plugin.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Creates a plugin instance for each new configuration.
pub trait ReportingPluginFactory {
    type Plugin: ReportingPlugin;
    type Error: std::error::Error + Send + Sync + 'static;

    fn new_reporting_plugin(
        &self,
        config: ReportingPluginConfig,
    ) -> Result<(Self::Plugin, ReportingPluginInfo), Self::Error>;
}
