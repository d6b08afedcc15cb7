// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::connector::ConnectorDefinition;
use crate::error::{CoreError, Result};

/// Default identifying label keys.
pub const DEFAULT_IDENTIFYING_LABELS: &str = "type";

/// authproxy core configuration
#[derive(Clone)]
pub struct Config {
    /// SQLite connection URL or file path
    pub database_url: String,
    /// base64 encoded 32 byte master encryption key
    pub encryption_key: String,
    /// JSON file declaring the connectors to reconcile
    pub connectors_file: Option<PathBuf>,
    /// Label keys correlating definitions that carry no id
    pub identifying_labels: Vec<String>,
    /// How long disconnect task results are retained
    pub disconnect_retention: Duration,
    /// How long `migrate` waits for the migration lock
    pub migration_lock_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `AUTHPROXY_DATABASE_URL`: SQLite connection string
    /// - `AUTHPROXY_ENCRYPTION_KEY`: base64 encoded 32 byte key
    ///
    /// Optional (with defaults):
    /// - `AUTHPROXY_CONNECTORS_FILE`: connector declarations (default: none)
    /// - `AUTHPROXY_IDENTIFYING_LABELS`: comma separated keys (default: `type`)
    /// - `AUTHPROXY_DISCONNECT_RETENTION_SECS`: (default: 600)
    /// - `AUTHPROXY_MIGRATION_LOCK_TIMEOUT_SECS`: (default: 60)
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let database_url = std::env::var("AUTHPROXY_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("AUTHPROXY_DATABASE_URL"))?;

        let encryption_key = std::env::var("AUTHPROXY_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("AUTHPROXY_ENCRYPTION_KEY"))?;

        let connectors_file = std::env::var("AUTHPROXY_CONNECTORS_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let identifying_labels: Vec<String> = std::env::var("AUTHPROXY_IDENTIFYING_LABELS")
            .unwrap_or_else(|_| DEFAULT_IDENTIFYING_LABELS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if identifying_labels.is_empty() {
            return Err(ConfigError::Invalid(
                "AUTHPROXY_IDENTIFYING_LABELS",
                "must name at least one label key",
            ));
        }

        let disconnect_retention: u64 = std::env::var("AUTHPROXY_DISCONNECT_RETENTION_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "AUTHPROXY_DISCONNECT_RETENTION_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let migration_lock_timeout: u64 = std::env::var("AUTHPROXY_MIGRATION_LOCK_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "AUTHPROXY_MIGRATION_LOCK_TIMEOUT_SECS",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            database_url,
            encryption_key,
            connectors_file,
            identifying_labels,
            disconnect_retention: Duration::from_secs(disconnect_retention),
            migration_lock_timeout: Duration::from_secs(migration_lock_timeout),
        })
    }

    /// Load the declared connectors, empty when no file is configured.
    pub fn load_connectors(&self) -> Result<Vec<ConnectorDefinition>> {
        match &self.connectors_file {
            Some(path) => load_connectors_file(path),
            None => Ok(Vec::new()),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("encryption_key", &"<redacted>")
            .field("connectors_file", &self.connectors_file)
            .field("identifying_labels", &self.identifying_labels)
            .field("disconnect_retention", &self.disconnect_retention)
            .field("migration_lock_timeout", &self.migration_lock_timeout)
            .finish()
    }
}

#[derive(Deserialize)]
struct ConnectorsFile {
    #[serde(default)]
    connectors: Vec<ConnectorDefinition>,
}

/// Read a connectors file: `{"connectors": [ ... ]}`.
pub fn load_connectors_file(path: &Path) -> Result<Vec<ConnectorDefinition>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CoreError::validation(
            "connectors_file",
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    let file: ConnectorsFile = serde_json::from_str(&raw).map_err(|e| {
        CoreError::validation(
            "connectors_file",
            format!("failed to parse {}: {}", path.display(), e),
        )
    })?;
    Ok(file.connectors)
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
