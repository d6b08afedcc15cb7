// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for authproxy-core.
//!
//! This module defines the store adapter the lifecycle services depend on and
//! the SQLite backend implementing it.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::connection::{ConnectionRecord, ConnectionState};
use crate::connector::{ConnectorVersionRecord, ConnectorVersionState};
use crate::error::CoreError;
use crate::labels::LabelSelector;
use crate::namespace::{Namespace, NamespaceMatcher};
use crate::probe::ProbeOutcomeRecord;

// ============================================================================
// Filters and aggregate rows
// ============================================================================

/// Filter options for listing connectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorFilter {
    /// Namespace or namespace subtree the representative version lives in.
    pub namespace: Option<NamespaceMatcher>,
    /// Only connectors with at least one version in one of these states.
    pub states: Vec<ConnectorVersionState>,
    /// Label selector applied to the version labels.
    pub selector: LabelSelector,
}

/// One connector id with its representative version and aggregates.
#[derive(Debug, Clone)]
pub struct ConnectorSummaryRecord {
    /// The primary version if one exists, else the latest version.
    pub record: ConnectorVersionRecord,
    /// Number of versions stored for the id.
    pub total_versions: u64,
    /// Distinct states across versions.
    pub states: BTreeSet<ConnectorVersionState>,
}

/// Filter options for listing connections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionFilter {
    /// Namespace or namespace subtree.
    pub namespace: Option<NamespaceMatcher>,
    /// Only these states; empty means all.
    pub states: Vec<ConnectionState>,
    /// Label selector applied to connection labels.
    pub selector: LabelSelector,
    /// Only connections bound to this connector id.
    pub connector_id: Option<Uuid>,
}

/// Keyset position for connection listing: `(created_at, id)` of the last row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionKey {
    /// Creation time of the last row returned.
    pub created_at: DateTime<Utc>,
    /// Id of the last row returned.
    pub id: Uuid,
}

// ============================================================================
// Persistence trait
// ============================================================================

/// Store adapter for namespaces, connector versions, connections and probe
/// outcomes.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    // ----- namespaces -----

    /// Fetch a namespace by path.
    async fn get_namespace(&self, path: &str) -> Result<Option<Namespace>, CoreError>;

    /// Insert a namespace. Returns `false` if it already existed.
    async fn create_namespace(&self, namespace: &Namespace) -> Result<bool, CoreError>;

    /// List namespaces, optionally restricted by a matcher, ordered by path.
    async fn list_namespaces(
        &self,
        matcher: Option<&NamespaceMatcher>,
    ) -> Result<Vec<Namespace>, CoreError>;

    // ----- connector versions -----

    /// Fetch one connector version.
    async fn get_connector_version(
        &self,
        id: Uuid,
        version: u64,
    ) -> Result<Option<ConnectorVersionRecord>, CoreError>;

    /// Fetch the highest version of `id` in `state`.
    async fn get_connector_version_for_state(
        &self,
        id: Uuid,
        state: ConnectorVersionState,
    ) -> Result<Option<ConnectorVersionRecord>, CoreError>;

    /// Fetch the highest version of `id` regardless of state.
    async fn get_latest_connector_version(
        &self,
        id: Uuid,
    ) -> Result<Option<ConnectorVersionRecord>, CoreError>;

    /// All versions of `id`, ascending.
    async fn get_connector_versions(
        &self,
        id: Uuid,
    ) -> Result<Vec<ConnectorVersionRecord>, CoreError>;

    /// Insert or replace a connector version.
    ///
    /// Writing a `primary` version demotes any other primary of the same id
    /// to `active` in the same transaction.
    async fn upsert_connector_version(
        &self,
        record: &ConnectorVersionRecord,
    ) -> Result<(), CoreError>;

    /// Distinct connector ids having at least one version matching `selector`.
    async fn find_connector_ids_by_labels(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<Uuid>, CoreError>;

    /// List connectors ordered by id, starting after `after`.
    async fn list_connectors(
        &self,
        filter: &ConnectorFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<ConnectorSummaryRecord>, CoreError>;

    // ----- connections -----

    /// Insert a new connection.
    async fn create_connection(&self, record: &ConnectionRecord) -> Result<(), CoreError>;

    /// Fetch a connection that has not been logically deleted.
    async fn get_connection(&self, id: Uuid) -> Result<Option<ConnectionRecord>, CoreError>;

    /// Set `state = to` iff the current state is one of `from`.
    ///
    /// Returns `false` when no row matched.
    async fn update_connection_state(
        &self,
        id: Uuid,
        from: &[ConnectionState],
        to: ConnectionState,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Physically delete a connection and its probe outcomes.
    async fn delete_connection(&self, id: Uuid) -> Result<bool, CoreError>;

    /// List connections ordered by `(created_at, id)`, starting after `after`.
    async fn list_connections(
        &self,
        filter: &ConnectionFilter,
        after: Option<ConnectionKey>,
        limit: usize,
    ) -> Result<Vec<ConnectionRecord>, CoreError>;

    // ----- probe outcomes -----

    /// Record one probe invocation.
    async fn record_probe_outcome(&self, outcome: &ProbeOutcomeRecord) -> Result<(), CoreError>;

    /// Most recent outcomes for a connection, newest first.
    async fn list_probe_outcomes(
        &self,
        connection_id: Uuid,
        probe_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ProbeOutcomeRecord>, CoreError>;

    // ----- named locks -----

    /// Try to take the lock `name` for `holder` with a lease of `ttl`.
    ///
    /// Succeeds if the lock is free, expired, or already held by `holder`.
    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Release the lock if `holder` owns it.
    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), CoreError>;
}
