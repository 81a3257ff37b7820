// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory implementations of the collaborators, for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures::StreamExt as _;
use keepers_base::{
    data_types::{PerformLog, UpkeepResult},
    identifiers::{BlockKey, UpkeepIdentifier, UpkeepKey},
    time::{timer, Duration},
};
use tokio::sync::broadcast;

use crate::{
    environment,
    interfaces::{
        HeadStream, HeadSubscriber, PerformLogProvider, ProviderError, Registry, ReportEncoder,
    },
};

#[derive(Default)]
struct RegistryState {
    active: Vec<UpkeepIdentifier>,
    /// The execute gas of the eligible upkeeps.
    eligible: HashMap<UpkeepIdentifier, u32>,
    failing: HashSet<UpkeepIdentifier>,
    fail_listing: bool,
    check_delay: Option<Duration>,
    checked: Vec<UpkeepKey>,
}

/// A registry answering from memory. Clones share their state.
#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
    check_calls: Arc<AtomicUsize>,
}

impl FakeRegistry {
    /// Creates a registry whose active upkeeps are `1..=count`, none of them eligible.
    pub fn with_upkeeps(count: u64) -> Self {
        let registry = FakeRegistry::default();
        registry.set_active((1..=count).map(UpkeepIdentifier::from).collect());
        registry
    }

    pub fn set_active(&self, identifiers: Vec<UpkeepIdentifier>) {
        self.state.lock().unwrap().active = identifiers;
    }

    /// Makes checks of `identifier` return eligible with `execute_gas`.
    pub fn set_eligible(&self, identifier: u64, execute_gas: u32) {
        self.state
            .lock()
            .unwrap()
            .eligible
            .insert(identifier.into(), execute_gas);
    }

    /// Makes every check call containing `identifier` fail.
    pub fn fail_checks_of(&self, identifier: u64) {
        self.state.lock().unwrap().failing.insert(identifier.into());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    /// Makes every check call take `delay`.
    pub fn set_check_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().check_delay = delay;
    }

    /// Returns every key checked so far, in call order.
    pub fn checked_keys(&self) -> Vec<UpkeepKey> {
        self.state.lock().unwrap().checked.clone()
    }

    pub fn clear_checked_keys(&self) {
        self.state.lock().unwrap().checked.clear();
    }

    /// Returns the number of check calls made so far.
    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }
}

impl Registry for FakeRegistry {
    async fn get_active_upkeep_ids(&self) -> Result<Vec<UpkeepIdentifier>, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(ProviderError::Rpc("listing upkeeps failed".to_owned()));
        }
        Ok(state.active.clone())
    }

    async fn check_upkeep(&self, keys: &[UpkeepKey]) -> Result<Vec<UpkeepResult>, ProviderError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().check_delay;
        if let Some(delay) = delay {
            timer::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.checked.extend_from_slice(keys);
        if let Some(key) = keys
            .iter()
            .find(|key| state.failing.contains(&key.identifier))
        {
            return Err(ProviderError::Rpc(format!("checking {key} failed")));
        }
        // Answer in reverse order: callers must not rely on the registry's ordering.
        Ok(keys
            .iter()
            .rev()
            .map(|key| match state.eligible.get(&key.identifier) {
                Some(gas) => UpkeepResult::eligible(key.clone(), *gas, key.to_string().into_bytes()),
                None => UpkeepResult::not_eligible(key.clone(), 1),
            })
            .collect())
    }
}

/// Chain heads pushed by the test. Every subscriber sees the heads sent after it subscribed.
#[derive(Clone)]
pub struct FakeHeads {
    sender: broadcast::Sender<BlockKey>,
}

impl Default for FakeHeads {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        FakeHeads { sender }
    }
}

impl FakeHeads {
    /// Publishes a new head. Returns the number of subscribers that will see it.
    pub fn send(&self, head: u64) -> usize {
        self.sender.send(BlockKey(head)).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl HeadSubscriber for FakeHeads {
    fn head_ticker(&self) -> HeadStream {
        futures::stream::unfold(self.sender.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(head) => return Some((head, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[derive(Default)]
struct LogState {
    perform: Vec<PerformLog>,
    stale: Vec<PerformLog>,
    fail: bool,
    delay: Option<Duration>,
}

/// Perform and stale-report logs pushed by the test. Clones share their state.
#[derive(Clone, Default)]
pub struct FakeLogProvider {
    state: Arc<Mutex<LogState>>,
    polls: Arc<AtomicUsize>,
}

impl FakeLogProvider {
    pub fn add_perform_log(&self, log: PerformLog) {
        self.state.lock().unwrap().perform.push(log);
    }

    pub fn add_stale_log(&self, log: PerformLog) {
        self.state.lock().unwrap().stale.push(log);
    }

    pub fn set_failing(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    /// Makes every read of the perform logs take `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Returns how many times the perform logs were read.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl PerformLogProvider for FakeLogProvider {
    async fn perform_logs(&self) -> Result<Vec<PerformLog>, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            timer::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.fail {
            return Err(ProviderError::Rpc("reading perform logs failed".to_owned()));
        }
        Ok(state.perform.clone())
    }

    async fn stale_report_logs(&self) -> Result<Vec<PerformLog>, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.fail {
            return Err(ProviderError::Rpc("reading stale logs failed".to_owned()));
        }
        Ok(state.stale.clone())
    }
}

/// Encodes reports as the BCS serialization of the results.
#[derive(Clone, Copy, Default)]
pub struct BcsReportEncoder;

impl ReportEncoder for BcsReportEncoder {
    fn encode_report(&self, results: &[UpkeepResult]) -> Result<Vec<u8>, ProviderError> {
        bcs::to_bytes(results).map_err(|error| ProviderError::Encode(error.to_string()))
    }

    fn decode_report(&self, report: &[u8]) -> Result<Vec<UpkeepResult>, ProviderError> {
        bcs::from_bytes(report).map_err(|error| ProviderError::Decode(error.to_string()))
    }
}

/// Builds a perform log for `key`, included at `transmit_block`.
pub fn perform_log(key: UpkeepKey, transmit_block: u64, confirmations: i64) -> PerformLog {
    PerformLog {
        transaction_hash: key.to_string().into_bytes(),
        key,
        transmit_block: BlockKey(transmit_block),
        confirmations,
    }
}

/// The fakes of a test environment, sharing state with the environment built from them.
#[derive(Clone, Default)]
pub struct TestHandles {
    pub registry: FakeRegistry,
    pub heads: FakeHeads,
    pub logs: FakeLogProvider,
}

impl TestHandles {
    pub fn with_upkeeps(count: u64) -> Self {
        TestHandles {
            registry: FakeRegistry::with_upkeeps(count),
            ..TestHandles::default()
        }
    }

    pub fn environment(&self) -> Arc<environment::Test> {
        Arc::new(environment::Impl {
            registry: self.registry.clone(),
            heads: self.heads.clone(),
            logs: self.logs.clone(),
            encoder: BcsReportEncoder,
        })
    }
}
