// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pool configuration.
//!
//! [`PoolConfig`] wires the pool together (local worker, discovery,
//! seams for tests); [`PoolTunables`] carries the numeric knobs, with
//! environment overrides layered under the `FORGE_POOL_` prefix, e.g.
//! `FORGE_POOL_FORWARD_MULTIPLIER=8`.

use crate::client::WorkerClient;
use crate::discovery::{ClientFactory, DiscoverySettings, ServiceBrowser};
use crate::fulfiller::FulfillerSettings;
use anyhow::Result;
use derive_builder::Builder;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

/// The one local worker, known at startup rather than discovered.
#[derive(Clone)]
pub struct LocalWorkerConfig {
    pub client: Arc<dyn WorkerClient>,
    pub unique_id: String,
    pub display_name: String,
}

impl std::fmt::Debug for LocalWorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkerConfig")
            .field("unique_id", &self.unique_id)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Numeric knobs for the reconciliation and discovery loops.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolTunables {
    /// Speculative over-provisioning factor. Fixed heuristic, not
    /// latency-adaptive; exposed so deployments can experiment.
    #[validate(range(min = 1, max = 64))]
    pub forward_multiplier: usize,
    #[validate(range(max = 64))]
    pub scale_down_hysteresis: usize,
    /// Delay before a worker whose attempt failed is probed again.
    #[validate(range(min = 1))]
    pub attempt_backoff_ms: u64,
    #[validate(range(min = 1))]
    pub ping_deadline_ms: u64,
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub discovery_poll_ms: u64,
    #[validate(range(min = 1))]
    pub discovery_backoff_ms: u64,
}

impl Default for PoolTunables {
    fn default() -> Self {
        Self {
            forward_multiplier: 4,
            scale_down_hysteresis: 2,
            attempt_backoff_ms: 100,
            ping_deadline_ms: 1_000,
            connect_timeout_ms: 5_000,
            discovery_poll_ms: 1_000,
            discovery_backoff_ms: 5_000,
        }
    }
}

impl PoolTunables {
    /// Defaults layered under `FORGE_POOL_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let tunables: PoolTunables = Figment::new()
            .merge(Serialized::defaults(PoolTunables::default()))
            .merge(Env::prefixed("FORGE_POOL_"))
            .extract()?;
        tunables.validate()?;
        Ok(tunables)
    }

    pub fn fulfiller_settings(&self) -> FulfillerSettings {
        FulfillerSettings {
            forward_multiplier: self.forward_multiplier,
            scale_down_hysteresis: self.scale_down_hysteresis,
            failed_attempt_backoff: Duration::from_millis(self.attempt_backoff_ms),
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            poll_interval: Duration::from_millis(self.discovery_poll_ms),
            error_backoff: Duration::from_millis(self.discovery_backoff_ms),
            ping_deadline: Duration::from_millis(self.ping_deadline_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

/// Pool assembly configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = PoolConfig::builder()
///     .enable_network_auto_discovery(true)
///     .local_worker(Some(local))
///     .build()?;
/// let pool = WorkerPool::new(config).await?;
/// ```
#[derive(Clone, Builder)]
#[builder(pattern = "owned")]
pub struct PoolConfig {
    #[builder(default = "false")]
    pub enable_network_auto_discovery: bool,
    #[builder(default)]
    pub local_worker: Option<LocalWorkerConfig>,
    #[builder(default)]
    pub tunables: PoolTunables,
    /// Advertisement source override; defaults to the mDNS browser.
    #[builder(default, setter(strip_option))]
    pub browser: Option<Arc<dyn ServiceBrowser>>,
    /// Client factory override for discovered addresses; defaults to TCP.
    #[builder(default, setter(strip_option))]
    pub remote_client_factory: Option<ClientFactory>,
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field(
                "enable_network_auto_discovery",
                &self.enable_network_auto_discovery,
            )
            .field("local_worker", &self.local_worker)
            .field("tunables", &self.tunables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let tunables = PoolTunables::default();
        assert!(tunables.validate().is_ok());
        assert_eq!(tunables.forward_multiplier, 4);
    }

    #[test]
    fn test_zero_multiplier_fails_validation() {
        let tunables = PoolTunables {
            forward_multiplier: 0,
            ..PoolTunables::default()
        };
        assert!(tunables.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("FORGE_POOL_FORWARD_MULTIPLIER", "8");
        let tunables = PoolTunables::from_env().unwrap();
        assert_eq!(tunables.forward_multiplier, 8);
        assert_eq!(tunables.scale_down_hysteresis, 2);
        std::env::remove_var("FORGE_POOL_FORWARD_MULTIPLIER");
    }

    #[test]
    fn test_builder_defaults() {
        let config = PoolConfig::builder().build().unwrap();
        assert!(!config.enable_network_auto_discovery);
        assert!(config.local_worker.is_none());
        assert!(config.browser.is_none());
    }
}
