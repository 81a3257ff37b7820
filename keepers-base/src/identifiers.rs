// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Identifiers of blocks and upkeeps.
//!
//! All comparisons and hashing are done on the numeric and byte representations. String
//! forms exist for logging only.

#[cfg(test)]
#[path = "unit_tests/identifiers_tests.rs"]
mod unit_tests;

use std::{
    fmt::{self, Display},
    num::ParseIntError,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{data_types::ArithmeticError, ensure};

/// The height of a block, as seen by the chain head subscriber.
///
/// The sentinel [`BlockKey::INDEFINITE`] sorts after every real height and is used to
/// block an upkeep until some event resolves it.
#[derive(
    Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash, Default, Debug, Serialize, Deserialize,
)]
#[cfg_attr(with_testing, derive(test_strategy::Arbitrary))]
pub struct BlockKey(pub u64);

impl BlockKey {
    /// The zero height.
    pub const ZERO: Self = Self(0);

    /// A key higher than any real block height.
    pub const INDEFINITE: Self = Self(u64::MAX);

    /// Whether this is the [`BlockKey::INDEFINITE`] sentinel.
    pub fn is_indefinite(&self) -> bool {
        *self == Self::INDEFINITE
    }

    /// Returns the key if it is a real block height, [`None`] for the sentinel.
    pub fn as_finite(self) -> Option<Self> {
        (!self.is_indefinite()).then_some(self)
    }

    /// Whether this key is strictly higher than `other`.
    pub fn after(&self, other: &BlockKey) -> bool {
        self > other
    }

    /// Returns the key of the following block.
    pub fn next(self) -> Result<Self, ArithmeticError> {
        ensure!(!self.is_indefinite(), ArithmeticError::Overflow);
        let val = self.0.checked_add(1).ok_or(ArithmeticError::Overflow)?;
        Ok(Self(val))
    }

    /// Moves the key `lag` blocks back, stopping at zero.
    pub fn saturating_sub(self, lag: u64) -> Self {
        Self(self.0.saturating_sub(lag))
    }
}

impl From<u64> for BlockKey {
    fn from(height: u64) -> Self {
        BlockKey(height)
    }
}

impl Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_indefinite() {
            write!(f, "indefinite")
        } else {
            self.0.fmt(f)
        }
    }
}

impl FromStr for BlockKey {
    type Err = ParseIntError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        if src == "indefinite" {
            return Ok(Self::INDEFINITE);
        }
        Ok(Self(u64::from_str(src)?))
    }
}

/// The handle of a registered upkeep. It carries no block information.
#[derive(
    Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Default, Debug, Serialize, Deserialize,
)]
#[cfg_attr(with_testing, derive(test_strategy::Arbitrary))]
pub struct UpkeepIdentifier(pub Vec<u8>);

impl UpkeepIdentifier {
    /// Returns the raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for UpkeepIdentifier {
    fn from(bytes: Vec<u8>) -> Self {
        UpkeepIdentifier(bytes)
    }
}

impl From<u64> for UpkeepIdentifier {
    fn from(id: u64) -> Self {
        UpkeepIdentifier(id.to_be_bytes().to_vec())
    }
}

impl Display for UpkeepIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl FromStr for UpkeepIdentifier {
    type Err = hex::FromHexError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let digits = src.strip_prefix("0x").unwrap_or(src);
        Ok(UpkeepIdentifier(hex::decode(digits)?))
    }
}

/// An upkeep, together with the block it is (or was) checked at.
///
/// Keys are ordered by block first, then by identifier.
#[derive(
    Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Default, Debug, Serialize, Deserialize,
)]
#[cfg_attr(with_testing, derive(test_strategy::Arbitrary))]
pub struct UpkeepKey {
    /// The block the upkeep is checked at.
    pub block: BlockKey,
    /// The upkeep.
    pub identifier: UpkeepIdentifier,
}

impl UpkeepKey {
    /// Creates a key for `identifier` at `block`.
    pub fn new(block: BlockKey, identifier: UpkeepIdentifier) -> Self {
        UpkeepKey { block, identifier }
    }

    /// Whether this key refers to a block strictly higher than `other`'s.
    pub fn after(&self, other: &UpkeepKey) -> bool {
        self.block.after(&other.block)
    }
}

impl Display for UpkeepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.block, self.identifier)
    }
}

/// An error when parsing an [`UpkeepKey`] from its string form.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ParseUpkeepKeyError {
    #[error("Upkeep key `{0}` is not of the form `<block>|<identifier>`")]
    MissingSeparator(String),
    #[error("Invalid block in upkeep key: {0}")]
    Block(#[from] ParseIntError),
    #[error("Invalid identifier in upkeep key: {0}")]
    Identifier(#[from] hex::FromHexError),
}

impl FromStr for UpkeepKey {
    type Err = ParseUpkeepKeyError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let (block, identifier) = src
            .split_once('|')
            .ok_or_else(|| ParseUpkeepKeyError::MissingSeparator(src.to_owned()))?;
        Ok(UpkeepKey {
            block: block.parse()?,
            identifier: identifier.parse()?,
        })
    }
}
