// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Choosing how many upkeeps to check, and in which order.
//!
//! Each node only checks a fraction of the active upkeeps on every head. The fraction is
//! chosen so that an upkeep is checked by at least one node within a number of rounds
//! with the configured probability.

#[cfg(test)]
#[path = "unit_tests/sampling_tests.rs"]
mod unit_tests;

use std::fmt;

use rand::{seq::SliceRandom as _, SeedableRng as _};
use rand_chacha::ChaCha20Rng;
use sha3::{Digest as _, Sha3_256};
use thiserror::Error;

use crate::ocr::ReportTimestamp;

/// Errors when computing a [`SampleRatio`].
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SamplingError {
    #[error("The number of rounds must be positive, got {0}")]
    InvalidRounds(i64),
    #[error("The number of nodes must be positive, got {0}")]
    InvalidNodes(i64),
    #[error("The target probability must be in (0, 1], got {0}")]
    InvalidProbability(f64),
}

/// The fraction of the active upkeeps a node checks on every head. Always in `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct SampleRatio(f64);

impl SampleRatio {
    /// Creates a ratio, clamping it into `[0, 1]`.
    pub fn new(ratio: f64) -> Self {
        if ratio.is_nan() {
            return SampleRatio(0.0);
        }
        SampleRatio(ratio.clamp(0.0, 1.0))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Returns how many items to sample out of `count`. Never more than `count`.
    pub fn of_int(&self, count: usize) -> usize {
        let sampled = (self.0 * count as f64).round() as usize;
        sampled.min(count)
    }
}

impl fmt::Display for SampleRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Computes the ratio `r` such that an upkeep sampled with probability `r` by each of
/// `nodes` nodes in each of `rounds` rounds is sampled at least once with the target
/// `probability`.
///
/// The result is rounded to the nearest hundredth.
pub fn sample_from_probability(
    rounds: i64,
    nodes: i64,
    probability: f64,
) -> Result<SampleRatio, SamplingError> {
    if rounds <= 0 {
        return Err(SamplingError::InvalidRounds(rounds));
    }
    if nodes <= 0 {
        return Err(SamplingError::InvalidNodes(nodes));
    }
    if !(probability > 0.0 && probability <= 1.0) {
        return Err(SamplingError::InvalidProbability(probability));
    }
    let miss = 1.0 - probability;
    let per_round = miss.powf(1.0 / rounds as f64);
    let per_node = per_round.powf(1.0 / nodes as f64);
    let ratio = ((1.0 - per_node) * 100.0).round() / 100.0;
    Ok(SampleRatio::new(ratio))
}

/// Shuffles `items` with fresh entropy from the thread-local generator.
pub fn shuffle_with_entropy<T>(items: &mut [T]) {
    items.shuffle(&mut rand::thread_rng());
}

/// A generator seeded by the identity of a round.
///
/// Every node derives the same sequence for the same round, so shuffles made with it agree
/// across the network without exchanging randomness.
pub struct RoundRng(ChaCha20Rng);

impl RoundRng {
    pub fn new(timestamp: &ReportTimestamp) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(timestamp.config_digest.0);
        hasher.update(timestamp.epoch.to_be_bytes());
        hasher.update([timestamp.round]);
        let seed: [u8; 32] = hasher.finalize().into();
        RoundRng(ChaCha20Rng::from_seed(seed))
    }

    /// Shuffles `items` in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.0);
    }
}

/// Shuffles `items` in the order every node derives for `timestamp`.
pub fn shuffle_for_round<T>(timestamp: &ReportTimestamp, items: &mut [T]) {
    RoundRng::new(timestamp).shuffle(items);
}
