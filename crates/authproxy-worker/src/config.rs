// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for authproxy-worker.

use std::time::Duration;

use authproxy_core::tasks::DEFAULT_QUEUE;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lifecycle core settings.
    pub core: authproxy_core::Config,
    /// Redis URL of the task queue; tasks stay in process when unset.
    pub redis_url: Option<String>,
    /// Queue the worker consumes.
    pub queue: String,
    /// Tasks processed concurrently.
    pub concurrency: usize,
    /// How often the probe scheduler reloads periodic probes.
    pub probe_refresh_interval: Duration,
    /// Reconcile configured connectors before processing tasks.
    pub migrate_on_start: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Besides the core variables:
    /// - `AUTHPROXY_REDIS_URL`: task queue (default: in-process queue)
    /// - `AUTHPROXY_WORKER_QUEUE`: (default: `default`)
    /// - `AUTHPROXY_WORKER_CONCURRENCY`: (default: 4)
    /// - `AUTHPROXY_PROBE_REFRESH_SECS`: (default: 60)
    /// - `AUTHPROXY_MIGRATE_ON_START`: (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let core = authproxy_core::Config::from_env()?;

        let redis_url = std::env::var("AUTHPROXY_REDIS_URL")
            .ok()
            .filter(|v| !v.is_empty());

        let queue =
            std::env::var("AUTHPROXY_WORKER_QUEUE").unwrap_or_else(|_| DEFAULT_QUEUE.to_string());

        let concurrency: usize = std::env::var("AUTHPROXY_WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "AUTHPROXY_WORKER_CONCURRENCY",
                "expected a positive integer",
            ))?;

        let probe_refresh_secs: u64 = std::env::var("AUTHPROXY_PROBE_REFRESH_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "AUTHPROXY_PROBE_REFRESH_SECS",
                "expected a positive number of seconds",
            ))?;

        let migrate_on_start = std::env::var("AUTHPROXY_MIGRATE_ON_START")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            core,
            redis_url,
            queue,
            concurrency,
            probe_refresh_interval: Duration::from_secs(probe_refresh_secs),
            migrate_on_start,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Core configuration is missing or invalid.
    #[error(transparent)]
    Core(#[from] authproxy_core::ConfigError),

    /// A variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
