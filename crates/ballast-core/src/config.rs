// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Ballast core configuration.
///
/// Retry bounds and the clearance timeout window are deliberately tunable:
/// the 10-second force-override is a liveness heuristic, not a proven-safe
/// constant, and some tables may want a longer window.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the owning service; used to derive the ledger table name.
    pub service_name: String,
    /// Deployment branch/build identifier appended to every topic name so
    /// staging and production traffic never cross.
    pub deploy_branch: String,
    /// Key prefix for clearance records in the KV store.
    pub clearance_prefix: String,
    /// Table-name prefix for the failed-operation ledger.
    pub ledger_table_prefix: String,
    /// In-process retry bound per action before broadcast hand-off.
    pub local_retry_bound: u32,
    /// Publish attempts before a broadcast is treated as a hard failure.
    pub publish_retry_bound: u32,
    /// Fixed delay between publish attempts.
    pub publish_retry_delay: Duration,
    /// Total time a clearance acquisition waits before force-override.
    pub clearance_wait: Duration,
    /// Poll interval while contending for clearance.
    pub clearance_poll_interval: Duration,
    /// Backoff before the first failover recovery probe.
    pub failover_initial_backoff: Duration,
    /// Spacing between failover recovery probes.
    pub failover_probe_interval: Duration,
    /// Consecutive successful probes required to leave the failing state.
    pub failover_probe_successes: u32,
}

impl Config {
    /// Create a configuration with production defaults for the given
    /// service and deployment branch.
    pub fn for_service(service_name: &str, deploy_branch: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            deploy_branch: deploy_branch.to_string(),
            clearance_prefix: "op-clearance-".to_string(),
            ledger_table_prefix: "failed-ops-".to_string(),
            local_retry_bound: 5,
            publish_retry_bound: 10,
            publish_retry_delay: Duration::from_millis(500),
            clearance_wait: Duration::from_secs(10),
            clearance_poll_interval: Duration::from_secs(1),
            failover_initial_backoff: Duration::from_secs(5),
            failover_probe_interval: Duration::from_millis(250),
            failover_probe_successes: 4,
        }
    }

    /// The ledger table name for this service.
    pub fn ledger_table(&self) -> String {
        format!("{}{}", self.ledger_table_prefix, self.service_name)
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `BALLAST_SERVICE_NAME`: name of the owning service
    /// - `BALLAST_DEPLOY_BRANCH`: deployment branch/build identifier
    ///
    /// Optional (with defaults):
    /// - `BALLAST_CLEARANCE_WAIT_SECS`: clearance window before force-override (default: 10)
    /// - `BALLAST_CLEARANCE_POLL_MS`: clearance poll interval (default: 1000)
    /// - `BALLAST_LOCAL_RETRY_BOUND`: in-process retries per action (default: 5)
    /// - `BALLAST_PUBLISH_RETRY_BOUND`: publish attempts per broadcast (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let service_name = std::env::var("BALLAST_SERVICE_NAME")
            .map_err(|_| ConfigError::Missing("BALLAST_SERVICE_NAME"))?;
        let deploy_branch = std::env::var("BALLAST_DEPLOY_BRANCH")
            .map_err(|_| ConfigError::Missing("BALLAST_DEPLOY_BRANCH"))?;

        let mut config = Self::for_service(&service_name, &deploy_branch);

        if let Ok(raw) = std::env::var("BALLAST_CLEARANCE_WAIT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                ConfigError::Invalid("BALLAST_CLEARANCE_WAIT_SECS", "must be a positive integer")
            })?;
            config.clearance_wait = Duration::from_secs(secs);
        }

        if let Ok(raw) = std::env::var("BALLAST_CLEARANCE_POLL_MS") {
            let ms: u64 = raw.parse().map_err(|_| {
                ConfigError::Invalid("BALLAST_CLEARANCE_POLL_MS", "must be a positive integer")
            })?;
            config.clearance_poll_interval = Duration::from_millis(ms);
        }

        if let Ok(raw) = std::env::var("BALLAST_LOCAL_RETRY_BOUND") {
            config.local_retry_bound = raw.parse().map_err(|_| {
                ConfigError::Invalid("BALLAST_LOCAL_RETRY_BOUND", "must be a positive integer")
            })?;
        }

        if let Ok(raw) = std::env::var("BALLAST_PUBLISH_RETRY_BOUND") {
            config.publish_retry_bound = raw.parse().map_err(|_| {
                ConfigError::Invalid("BALLAST_PUBLISH_RETRY_BOUND", "must be a positive integer")
            })?;
        }

        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
