// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

#[cfg(test)]
#[path = "unit_tests/observation_tests.rs"]
mod unit_tests;

use std::io;

use keepers_base::{
    identifiers::{BlockKey, UpkeepIdentifier},
    limited_writer::LimitedWriter,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservationError {
    #[error(transparent)]
    Bcs(#[from] bcs::Error),
    #[error("An observation without identifiers does not fit in {limit} bytes")]
    TooLarge { limit: usize },
}

/// What one node proposes for a round: the head it sampled at and the eligible upkeeps it
/// found.
#[derive(Eq, PartialEq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct Observation {
    pub block_key: BlockKey,
    pub identifiers: Vec<UpkeepIdentifier>,
}

impl Observation {
    pub fn new(block_key: BlockKey, identifiers: Vec<UpkeepIdentifier>) -> Self {
        Observation {
            block_key,
            identifiers,
        }
    }

    /// Encodes as many of the identifiers as fit in `limit` bytes, in order.
    ///
    /// Identifiers that do not fit are dropped. Fails only if the observation does not fit
    /// even without identifiers.
    pub fn encode_limited(&self, limit: usize) -> Result<Vec<u8>, ObservationError> {
        let mut candidate = Observation::new(self.block_key, Vec::new());
        if !Self::fits(&candidate, limit) {
            return Err(ObservationError::TooLarge { limit });
        }
        for identifier in &self.identifiers {
            candidate.identifiers.push(identifier.clone());
            if !Self::fits(&candidate, limit) {
                candidate.identifiers.pop();
                break;
            }
        }
        Ok(bcs::to_bytes(&candidate)?)
    }

    fn fits(observation: &Observation, limit: usize) -> bool {
        let mut writer = LimitedWriter::new(io::sink(), limit);
        bcs::serialize_into(&mut writer, observation).is_ok()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ObservationError> {
        Ok(bcs::from_bytes(bytes)?)
    }
}
