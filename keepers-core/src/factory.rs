// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

#[cfg(test)]
#[path = "unit_tests/factory_tests.rs"]
mod unit_tests;

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::{
    config::{ConfigError, KeepersConfig, OffchainConfig},
    coordinator::ReportCoordinator,
    environment::Environment,
    ocr::{
        ReportingPluginConfig, ReportingPluginFactory, ReportingPluginInfo, ReportingPluginLimits,
    },
    plugin::{KeepersPlugin, PluginError, MAX_OBSERVATION_LENGTH, MAX_REPORT_LENGTH},
    sampling::sample_from_probability,
    service::UpkeepService,
};

struct Running<Env: Environment> {
    service: Arc<UpkeepService<Env>>,
    coordinator: Arc<ReportCoordinator<Env>>,
}

/// Builds a plugin for every new configuration.
///
/// Only the latest configuration runs: the service and coordinator of the previous one
/// are stopped when a new plugin is created.
pub struct PluginFactory<Env: Environment> {
    environment: Arc<Env>,
    config: KeepersConfig,
    running: Mutex<Option<Running<Env>>>,
}

impl<Env: Environment> PluginFactory<Env> {
    pub fn new(environment: Arc<Env>, config: KeepersConfig) -> Self {
        PluginFactory {
            environment,
            config,
            running: Mutex::new(None),
        }
    }

    /// Stops the service and coordinator of the latest configuration, if any.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().unwrap().take() {
            running.service.stop();
            running.coordinator.stop();
        }
    }

    fn info(config: &ReportingPluginConfig) -> ReportingPluginInfo {
        ReportingPluginInfo {
            name: format!(
                "Upkeep coordination plugin of oracle {} for digest {}",
                config.oracle_id.0, config.config_digest
            ),
            unique_reports: false,
            limits: ReportingPluginLimits {
                max_query_length: 0,
                max_observation_length: MAX_OBSERVATION_LENGTH,
                max_report_length: MAX_REPORT_LENGTH,
            },
        }
    }
}

impl<Env: Environment> ReportingPluginFactory for PluginFactory<Env> {
    type Plugin = KeepersPlugin<Env>;
    type Error = PluginError;

    /// Must be called within a Tokio runtime.
    fn new_reporting_plugin(
        &self,
        config: ReportingPluginConfig,
    ) -> Result<(KeepersPlugin<Env>, ReportingPluginInfo), PluginError> {
        self.config.validate()?;
        let offchain = OffchainConfig::decode(&config.offchain_config)?;
        let nodes = i64::try_from(config.n).unwrap_or(i64::MAX);
        let probability = offchain.probability()?;
        let ratio = sample_from_probability(offchain.target_in_rounds, nodes, probability)
            .map_err(ConfigError::from)?;

        let mut running = self.running.lock().unwrap();
        if let Some(previous) = running.take() {
            previous.service.stop();
            previous.coordinator.stop();
        }
        let service = Arc::new(UpkeepService::new(
            self.environment.clone(),
            ratio,
            offchain.sampling_job_duration(),
            &self.config,
        ));
        let coordinator = Arc::new(ReportCoordinator::new(
            self.environment.clone(),
            offchain.perform_lockout_window(),
            offchain.min_confirmations(),
            self.config.log_poll_interval(),
            self.config.cache_eviction_interval(),
        ));
        service.start();
        coordinator.start();
        *running = Some(Running {
            service: service.clone(),
            coordinator: coordinator.clone(),
        });

        info!(
            digest = %config.config_digest,
            oracle = config.oracle_id.0,
            nodes,
            %ratio,
            "created reporting plugin"
        );
        let plugin = KeepersPlugin::new(
            self.environment.clone(),
            service,
            coordinator,
            offchain,
        );
        Ok((plugin, Self::info(&config)))
    }
}

impl<Env: Environment> Drop for PluginFactory<Env> {
    fn drop(&mut self) {
        self.stop();
    }
}
