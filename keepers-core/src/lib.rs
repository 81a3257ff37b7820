// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! This module defines the core of the upkeep coordination plugin: sampling and checking
//! upkeeps on every chain head, agreeing on a report each round, and tracking reported
//! upkeeps until their transmission is confirmed on chain.

pub mod config;
pub mod coordinator;
pub mod environment;
pub mod factory;
pub mod interfaces;
pub mod observation;
pub mod ocr;
pub mod plugin;
pub mod sampling;
pub mod service;
#[cfg(with_testing)]
pub mod test_utils;
pub mod worker_pool;

pub use environment::Environment;
