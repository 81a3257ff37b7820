// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tests a network of nodes going through whole rounds: observing, reporting, accepting
//! and transmitting, then unblocking once the transmission is confirmed.

use keepers_base::{
    identifiers::{BlockKey, UpkeepIdentifier, UpkeepKey},
    time::{timer, Duration},
};
use keepers_core::{
    config::KeepersConfig,
    environment,
    factory::PluginFactory,
    interfaces::ReportEncoder as _,
    observation::Observation,
    ocr::{
        AttributedObservation, ConfigDigest, OracleId, ReportTimestamp, ReportingPlugin as _,
        ReportingPluginConfig, ReportingPluginFactory as _,
    },
    plugin::KeepersPlugin,
    test_utils::{perform_log, BcsReportEncoder, TestHandles},
};

const NODES: usize = 4;
const DIGEST: ConfigDigest = ConfigDigest([9; 32]);
const OFFCHAIN_CONFIG: &str = r#"{
    "targetProbability": "1",
    "targetInRounds": 1,
    "maxUpkeepBatchSize": 5
}"#;

fn plugin_config(oracle: u8) -> ReportingPluginConfig {
    ReportingPluginConfig {
        config_digest: DIGEST,
        oracle_id: OracleId(oracle),
        n: NODES,
        f: 1,
        onchain_config: Vec::new(),
        offchain_config: OFFCHAIN_CONFIG.as_bytes().to_vec(),
        estimated_round_interval: Duration::from_secs(1),
        max_duration_query: Duration::from_secs(1),
        max_duration_observation: Duration::from_secs(1),
        max_duration_report: Duration::from_secs(1),
        max_duration_should_accept_finalized_report: Duration::from_secs(1),
        max_duration_should_transmit_accepted_report: Duration::from_secs(1),
    }
}

fn timestamp(epoch: u32, round: u8) -> ReportTimestamp {
    ReportTimestamp {
        config_digest: DIGEST,
        epoch,
        round,
    }
}

async fn observe(
    plugins: &[KeepersPlugin<environment::Test>],
    timestamp: &ReportTimestamp,
) -> Vec<AttributedObservation> {
    let mut observations = Vec::new();
    for (oracle, plugin) in plugins.iter().enumerate() {
        observations.push(AttributedObservation {
            observation: plugin.observation(timestamp, &[]).await.unwrap(),
            observer: OracleId(oracle as u8),
        });
    }
    observations
}

fn observed_identifiers(observations: &[AttributedObservation]) -> Vec<Vec<UpkeepIdentifier>> {
    observations
        .iter()
        .map(|attributed| {
            Observation::decode(&attributed.observation)
                .unwrap()
                .identifiers
        })
        .collect()
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_rounds_across_nodes() {
    let handles = TestHandles::with_upkeeps(20);
    for identifier in [3, 8, 15] {
        handles.registry.set_eligible(identifier, 100_000);
    }
    let factories = (0..NODES)
        .map(|_| PluginFactory::new(handles.environment(), KeepersConfig::default()))
        .collect::<Vec<_>>();
    let plugins = factories
        .iter()
        .enumerate()
        .map(|(oracle, factory)| {
            factory
                .new_reporting_plugin(plugin_config(oracle as u8))
                .unwrap()
                .0
        })
        .collect::<Vec<_>>();
    while handles.heads.subscriber_count() < NODES {
        timer::sleep(Duration::from_millis(1)).await;
    }
    handles.heads.send(100);
    timer::sleep(Duration::from_millis(100)).await;

    // Every node derives the same observation from the same sample.
    let round = timestamp(1, 1);
    let observations = observe(&plugins, &round).await;
    let identifiers = observed_identifiers(&observations);
    assert!(identifiers.iter().all(|observed| observed == &identifiers[0]));
    assert_eq!(identifiers[0].len(), 1);
    let reported = identifiers[0][0].clone();

    let report = plugins[0]
        .report(&round, &[], &observations)
        .await
        .unwrap()
        .unwrap();
    let results = BcsReportEncoder.decode_report(&report).unwrap();
    assert_eq!(results.len(), 1);
    let key = UpkeepKey::new(BlockKey(100), reported.clone());
    assert_eq!(results[0].key, key);

    for plugin in &plugins {
        assert!(plugin
            .should_accept_finalized_report(&round, &report)
            .await
            .unwrap());
        assert!(plugin
            .should_transmit_accepted_report(&round, &report)
            .await
            .unwrap());
    }

    // The reported upkeep is blocked everywhere until its perform log is seen.
    let next_round = timestamp(1, 2);
    let observations = observe(&plugins, &next_round).await;
    for observed in observed_identifiers(&observations) {
        assert_eq!(observed.len(), 1);
        assert_ne!(observed[0], reported);
    }

    handles.logs.add_perform_log(perform_log(key.clone(), 101, 1));
    timer::sleep(Duration::from_millis(1_500)).await;
    for plugin in &plugins {
        assert!(!plugin
            .should_transmit_accepted_report(&next_round, &report)
            .await
            .unwrap());
        assert!(plugin.coordinator().is_transmission_confirmed(&key));
    }

    // Once a head past the transmit block is sampled, the upkeep can be reported again.
    handles.heads.send(102);
    timer::sleep(Duration::from_millis(100)).await;
    let filter = plugins[0].coordinator().filter();
    assert!(filter(&UpkeepKey::new(BlockKey(102), reported.clone())));
    let (head, sample) = plugins[0].service().sample_upkeeps(&[&filter]).unwrap();
    assert_eq!(head, BlockKey(102));
    assert!(sample.iter().any(|result| result.key.identifier == reported));

    for factory in &factories {
        factory.stop();
    }
}
