// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connections: tenant-bound instances of one connector version.
//!
//! State machine:
//!
//! ```text
//! created ──► ready ──► disconnecting ──► disconnected (row deleted)
//!    └──────────────────────┘
//! ```
//!
//! A connection is pinned to the `(connector_id, connector_version)` it was
//! created with and never follows the connector's primary pointer.

mod service;

pub use service::{ListConnectionsBuilder, ListConnectionsCursor};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::connector::{ConnectorVersion, ConnectorVersionId};
use crate::error::{CoreError, Result};
use crate::labels::Labels;
use crate::persistence::Persistence;
use crate::probe::Probe;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Persisted, credentials not yet established.
    Created,
    /// Usable.
    Ready,
    /// Teardown requested.
    Disconnecting,
    /// Torn down; about to be deleted.
    Disconnected,
}

impl ConnectionState {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }

    /// States a connection may move to `self` from.
    ///
    /// Re-entering the current state is allowed so redelivered tasks are
    /// no-ops rather than failures.
    pub fn allowed_predecessors(&self) -> &'static [ConnectionState] {
        match self {
            Self::Created => &[],
            Self::Ready => &[Self::Created, Self::Ready],
            Self::Disconnecting => &[Self::Created, Self::Ready, Self::Disconnecting],
            Self::Disconnected => &[Self::Disconnecting, Self::Disconnected],
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        to.allowed_predecessors().contains(self)
    }

    /// Whether probes run for connections in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Created | Self::Ready)
    }
}

impl FromStr for ConnectionState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "ready" => Ok(Self::Ready),
            "disconnecting" => Ok(Self::Disconnecting),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(CoreError::validation(
                "state",
                format!("unknown connection state '{}'", other),
            )),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Connection id.
    pub id: Uuid,
    /// Namespace the connection lives in.
    pub namespace: String,
    /// Current state.
    pub state: ConnectionState,
    /// Bound connector id.
    pub connector_id: Uuid,
    /// Bound connector version.
    pub connector_version: u64,
    /// Labels.
    pub labels: Labels,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set when the connection is logically deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// Identity of the bound connector version.
    pub fn connector_version_id(&self) -> ConnectorVersionId {
        ConnectorVersionId {
            id: self.connector_id,
            version: self.connector_version,
        }
    }
}

/// A connection bound to its resolved connector version.
#[derive(Debug, Clone)]
pub struct ConnectionEntity {
    record: ConnectionRecord,
    connector_version: Arc<ConnectorVersion>,
}

impl ConnectionEntity {
    /// Bind a record to its connector version.
    pub fn new(record: ConnectionRecord, connector_version: Arc<ConnectorVersion>) -> Self {
        Self {
            record,
            connector_version,
        }
    }

    /// Connection id.
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    /// Current state as last loaded.
    pub fn state(&self) -> ConnectionState {
        self.record.state
    }

    /// Namespace.
    pub fn namespace(&self) -> &str {
        &self.record.namespace
    }

    /// The persisted record.
    pub fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    /// The bound connector version.
    pub fn connector_version(&self) -> &Arc<ConnectorVersion> {
        &self.connector_version
    }

    /// Probes of the bound connector version.
    pub async fn probes(&self) -> Result<Vec<Probe>> {
        self.connector_version.probes().await
    }

    /// Look up a probe of the bound connector version.
    pub async fn probe(&self, probe_id: &str) -> Result<Probe> {
        self.connector_version.probe(probe_id).await
    }

    /// Move the connection to `to`, conditional on its current stored state.
    ///
    /// Fails with `NotFound` if the row is gone and `InvalidStateTransition`
    /// if its stored state does not allow the move.
    pub async fn set_state(&mut self, store: &dyn Persistence, to: ConnectionState) -> Result<()> {
        let now = Utc::now();
        let updated = store
            .update_connection_state(self.record.id, to.allowed_predecessors(), to, now)
            .await?;

        if !updated {
            return match store.get_connection(self.record.id).await? {
                None => Err(CoreError::not_found("connection", self.record.id)),
                Some(current) => Err(CoreError::InvalidStateTransition {
                    id: self.record.id,
                    from: current.state.to_string(),
                    to: to.to_string(),
                }),
            };
        }

        info!(
            connection_id = %self.record.id,
            from = %self.record.state,
            to = %to,
            "Connection state changed"
        );
        self.record.state = to;
        self.record.updated_at = now;
        Ok(())
    }
}
