// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The capabilities this crate needs from the outside world: the upkeep registry, chain
//! heads, on-chain perform logs and the report wire format.

use futures::stream::BoxStream;
use keepers_base::{
    data_types::{PerformLog, UpkeepResult},
    identifiers::{BlockKey, UpkeepIdentifier, UpkeepKey},
};
use thiserror::Error;

/// A pinned [`Stream`][futures::Stream] of new chain heads.
pub type HeadStream = BoxStream<'static, BlockKey>;

/// Errors reported by the collaborators.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    #[error("RPC call failed: {0}")]
    Rpc(String),
    #[error("Failed to decode: {0}")]
    Decode(String),
    #[error("Failed to encode: {0}")]
    Encode(String),
    #[error("The request was cancelled")]
    Cancelled,
}

/// The on-chain registry of upkeeps.
#[allow(async_fn_in_trait)]
#[trait_variant::make(Send)]
pub trait Registry {
    /// Returns the identifiers of every upkeep that can currently be checked.
    async fn get_active_upkeep_ids(&self) -> Result<Vec<UpkeepIdentifier>, ProviderError>;

    /// Simulates the check of each upkeep at the block given in its key.
    ///
    /// The results may come back in any order, but there is one per key.
    async fn check_upkeep(&self, keys: &[UpkeepKey]) -> Result<Vec<UpkeepResult>, ProviderError>;
}

/// A source of new chain heads.
pub trait HeadSubscriber {
    /// Subscribes to new chain heads. Every new head is sent once.
    fn head_ticker(&self) -> HeadStream;
}

/// A source of logs emitted by the registry when reports are performed or rejected.
#[allow(async_fn_in_trait)]
#[trait_variant::make(Send)]
pub trait PerformLogProvider {
    /// Returns the recent logs of performed upkeeps.
    async fn perform_logs(&self) -> Result<Vec<PerformLog>, ProviderError>;

    /// Returns the recent logs of reports rejected as stale.
    async fn stale_report_logs(&self) -> Result<Vec<PerformLog>, ProviderError>;
}

/// The wire format of reports transmitted on chain.
pub trait ReportEncoder {
    /// Encodes the results into a report.
    fn encode_report(&self, results: &[UpkeepResult]) -> Result<Vec<u8>, ProviderError>;

    /// Decodes a report back into results.
    fn decode_report(&self, report: &[u8]) -> Result<Vec<UpkeepResult>, ProviderError>;
}
