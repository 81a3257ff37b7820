// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core data-types used when checking and performing upkeeps.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifiers::{BlockKey, UpkeepKey};

/// An error type for arithmetic errors.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum ArithmeticError {
    #[error("Number overflow")]
    Overflow,
    #[error("Number underflow")]
    Underflow,
}

/// Whether an upkeep should be performed, as determined by simulating its check.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash, Default, Debug, Serialize, Deserialize)]
#[cfg_attr(with_testing, derive(test_strategy::Arbitrary))]
pub enum UpkeepState {
    /// The check returned `false`, or failed for a reason recorded in the result.
    #[default]
    NotEligible,
    /// The check returned `true`: the upkeep can be performed on chain.
    Eligible,
}

impl fmt::Display for UpkeepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpkeepState::NotEligible => write!(f, "not eligible"),
            UpkeepState::Eligible => write!(f, "eligible"),
        }
    }
}

/// The outcome of checking one upkeep at one block.
#[derive(Eq, PartialEq, Clone, Hash, Debug, Serialize, Deserialize)]
#[cfg_attr(with_testing, derive(test_strategy::Arbitrary))]
pub struct UpkeepResult {
    /// The checked upkeep and the block it was checked at.
    pub key: UpkeepKey,
    /// Whether the upkeep can be performed.
    pub state: UpkeepState,
    /// A registry-specific code explaining why the upkeep is not eligible.
    pub failure_reason: u8,
    /// The gas the perform call is expected to use.
    pub execute_gas: u32,
    /// The data to pass to the perform call.
    pub perform_data: Vec<u8>,
}

impl UpkeepResult {
    /// Creates an eligible result for `key`.
    pub fn eligible(key: UpkeepKey, execute_gas: u32, perform_data: Vec<u8>) -> Self {
        UpkeepResult {
            key,
            state: UpkeepState::Eligible,
            failure_reason: 0,
            execute_gas,
            perform_data,
        }
    }

    /// Creates a non-eligible result for `key`.
    pub fn not_eligible(key: UpkeepKey, failure_reason: u8) -> Self {
        UpkeepResult {
            key,
            state: UpkeepState::NotEligible,
            failure_reason,
            execute_gas: 0,
            perform_data: Vec::new(),
        }
    }

    /// Whether the upkeep can be performed.
    pub fn is_eligible(&self) -> bool {
        self.state == UpkeepState::Eligible
    }
}

/// An on-chain log showing that a report for an upkeep was performed, or was rejected as stale.
#[derive(Eq, PartialEq, Clone, Hash, Debug, Serialize, Deserialize)]
pub struct PerformLog {
    /// The key (check block and upkeep) that the report was built from.
    pub key: UpkeepKey,
    /// The hash of the transaction that emitted the log.
    pub transaction_hash: Vec<u8>,
    /// The block in which the transaction was included.
    pub transmit_block: BlockKey,
    /// The number of blocks mined on top of `transmit_block`.
    pub confirmations: i64,
}
