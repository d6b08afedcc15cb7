// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::connection::{ConnectionRecord, ConnectionState};
use crate::connector::{ConnectorVersionRecord, ConnectorVersionState};
use crate::error::CoreError;
use crate::labels::{LabelSelector, Labels, Requirement};
use crate::namespace::{Namespace, NamespaceMatcher};
use crate::probe::ProbeOutcomeRecord;

use super::{ConnectionFilter, ConnectionKey, ConnectorFilter, ConnectorSummaryRecord, Persistence};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Fixed-width timestamp format so TEXT ordering matches time ordering.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The schema must already be migrated (see [`crate::migrations::run_sqlite`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/authproxy.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Private in-memory database on a single, never recycled connection.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Row types and conversions
// ============================================================================

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, CoreError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| corrupt("timestamp", value, e))
}

fn parse_uuid(value: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(value).map_err(|e| corrupt("uuid", value, e))
}

fn parse_labels(value: &str) -> Result<Labels, CoreError> {
    serde_json::from_str(value).map_err(|e| corrupt("labels", value, e))
}

fn encode_labels(labels: &Labels) -> Result<String, CoreError> {
    Ok(serde_json::to_string(labels)?)
}

fn to_u64(value: i64, column: &str) -> Result<u64, CoreError> {
    u64::try_from(value).map_err(|e| corrupt(column, &value.to_string(), e))
}

fn to_i64(value: u64, field: &str) -> Result<i64, CoreError> {
    i64::try_from(value).map_err(|_| {
        CoreError::validation(field, format!("{} exceeds the storable range", value))
    })
}

fn corrupt(column: &str, value: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::Database {
        operation: "decode".to_string(),
        details: format!("invalid {} value '{}': {}", column, value, err),
    }
}

#[derive(sqlx::FromRow)]
struct NamespaceRow {
    path: String,
    state: String,
    labels: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<NamespaceRow> for Namespace {
    type Error = CoreError;

    fn try_from(row: NamespaceRow) -> Result<Self, CoreError> {
        Ok(Namespace {
            state: row.state.parse()?,
            labels: parse_labels(&row.labels)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            path: row.path,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectorVersionRow {
    id: String,
    version: i64,
    namespace: String,
    state: String,
    labels: String,
    hash: String,
    encrypted_definition: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ConnectorVersionRow> for ConnectorVersionRecord {
    type Error = CoreError;

    fn try_from(row: ConnectorVersionRow) -> Result<Self, CoreError> {
        Ok(ConnectorVersionRecord {
            id: parse_uuid(&row.id)?,
            version: to_u64(row.version, "version")?,
            state: row.state.parse()?,
            labels: parse_labels(&row.labels)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            namespace: row.namespace,
            hash: row.hash,
            encrypted_definition: row.encrypted_definition,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectorSummaryRow {
    #[sqlx(flatten)]
    version: ConnectorVersionRow,
    total_versions: i64,
    states: String,
}

impl TryFrom<ConnectorSummaryRow> for ConnectorSummaryRecord {
    type Error = CoreError;

    fn try_from(row: ConnectorSummaryRow) -> Result<Self, CoreError> {
        let states = row
            .states
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse::<ConnectorVersionState>)
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(ConnectorSummaryRecord {
            record: row.version.try_into()?,
            total_versions: to_u64(row.total_versions, "total_versions")?,
            states,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: String,
    namespace: String,
    state: String,
    connector_id: String,
    connector_version: i64,
    labels: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl TryFrom<ConnectionRow> for ConnectionRecord {
    type Error = CoreError;

    fn try_from(row: ConnectionRow) -> Result<Self, CoreError> {
        Ok(ConnectionRecord {
            id: parse_uuid(&row.id)?,
            state: row.state.parse()?,
            connector_id: parse_uuid(&row.connector_id)?,
            connector_version: to_u64(row.connector_version, "connector_version")?,
            labels: parse_labels(&row.labels)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            deleted_at: row.deleted_at.as_deref().map(parse_ts).transpose()?,
            namespace: row.namespace,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProbeOutcomeRow {
    connection_id: String,
    probe_id: String,
    outcome: String,
    status_code: Option<i64>,
    error: Option<String>,
    duration_ms: i64,
    started_at: String,
}

impl TryFrom<ProbeOutcomeRow> for ProbeOutcomeRecord {
    type Error = CoreError;

    fn try_from(row: ProbeOutcomeRow) -> Result<Self, CoreError> {
        Ok(ProbeOutcomeRecord {
            connection_id: parse_uuid(&row.connection_id)?,
            outcome: row.outcome.parse()?,
            status_code: row
                .status_code
                .map(|c| u16::try_from(c).map_err(|e| corrupt("status_code", &c.to_string(), e)))
                .transpose()?,
            duration_ms: to_u64(row.duration_ms, "duration_ms")?,
            started_at: parse_ts(&row.started_at)?,
            probe_id: row.probe_id,
            error: row.error,
        })
    }
}

// ============================================================================
// Query fragments
// ============================================================================

/// JSON path for a label key; keys are validated so quoting is safe.
fn label_path(key: &str) -> String {
    format!("$.\"{}\"", key)
}

fn push_selector(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, selector: &LabelSelector) {
    for requirement in selector.requirements() {
        match requirement {
            Requirement::Equals(k, v) => {
                qb.push(format!(" AND json_extract({}, ", column));
                qb.push_bind(label_path(k));
                qb.push(") = ");
                qb.push_bind(v.clone());
            }
            Requirement::NotEquals(k, v) => {
                qb.push(format!(" AND COALESCE(json_extract({}, ", column));
                qb.push_bind(label_path(k));
                qb.push(") != ");
                qb.push_bind(v.clone());
                qb.push(", 1)");
            }
            Requirement::Exists(k) => {
                qb.push(format!(" AND json_type({}, ", column));
                qb.push_bind(label_path(k));
                qb.push(") IS NOT NULL");
            }
            Requirement::NotExists(k) => {
                qb.push(format!(" AND json_type({}, ", column));
                qb.push_bind(label_path(k));
                qb.push(") IS NULL");
            }
        }
    }
}

fn push_namespace(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, matcher: &NamespaceMatcher) {
    match matcher {
        NamespaceMatcher::Exact(path) => {
            qb.push(format!(" AND {} = ", column));
            qb.push_bind(path.clone());
        }
        NamespaceMatcher::Subtree(path) => {
            let prefix = format!("{}.", path);
            qb.push(format!(" AND ({} = ", column));
            qb.push_bind(path.clone());
            qb.push(format!(" OR substr({}, 1, ", column));
            qb.push_bind(prefix.len() as i64);
            qb.push(") = ");
            qb.push_bind(prefix);
            qb.push(")");
        }
    }
}

fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[&'static str]) {
    qb.push(format!(" AND {} IN (", column));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(*value);
    }
    separated.push_unseparated(")");
}

const CONNECTOR_VERSION_COLUMNS: &str = "id, version, namespace, state, labels, hash, \
     encrypted_definition, created_at, updated_at";

const CONNECTION_COLUMNS: &str = "id, namespace, state, connector_id, connector_version, \
     labels, created_at, updated_at, deleted_at";

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ----- namespaces -----

    async fn get_namespace(&self, path: &str) -> Result<Option<Namespace>, CoreError> {
        let row = sqlx::query_as::<_, NamespaceRow>(
            r#"
            SELECT path, state, labels, created_at, updated_at
            FROM namespaces
            WHERE path = ?
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Namespace::try_from).transpose()
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO namespaces (path, state, labels, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (path) DO NOTHING
            "#,
        )
        .bind(&namespace.path)
        .bind(namespace.state.as_str())
        .bind(encode_labels(&namespace.labels)?)
        .bind(fmt_ts(namespace.created_at))
        .bind(fmt_ts(namespace.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_namespaces(
        &self,
        matcher: Option<&NamespaceMatcher>,
    ) -> Result<Vec<Namespace>, CoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT path, state, labels, created_at, updated_at FROM namespaces WHERE 1 = 1",
        );
        if let Some(matcher) = matcher {
            push_namespace(&mut qb, "path", matcher);
        }
        qb.push(" ORDER BY path");

        let rows = qb
            .build_query_as::<NamespaceRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Namespace::try_from).collect()
    }

    // ----- connector versions -----

    async fn get_connector_version(
        &self,
        id: Uuid,
        version: u64,
    ) -> Result<Option<ConnectorVersionRecord>, CoreError> {
        let version = to_i64(version, "version")?;
        let row = sqlx::query_as::<_, ConnectorVersionRow>(&format!(
            "SELECT {} FROM connector_versions WHERE id = ? AND version = ?",
            CONNECTOR_VERSION_COLUMNS
        ))
        .bind(id.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConnectorVersionRecord::try_from).transpose()
    }

    async fn get_connector_version_for_state(
        &self,
        id: Uuid,
        state: ConnectorVersionState,
    ) -> Result<Option<ConnectorVersionRecord>, CoreError> {
        let row = sqlx::query_as::<_, ConnectorVersionRow>(&format!(
            "SELECT {} FROM connector_versions WHERE id = ? AND state = ? \
             ORDER BY version DESC LIMIT 1",
            CONNECTOR_VERSION_COLUMNS
        ))
        .bind(id.to_string())
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConnectorVersionRecord::try_from).transpose()
    }

    async fn get_latest_connector_version(
        &self,
        id: Uuid,
    ) -> Result<Option<ConnectorVersionRecord>, CoreError> {
        let row = sqlx::query_as::<_, ConnectorVersionRow>(&format!(
            "SELECT {} FROM connector_versions WHERE id = ? ORDER BY version DESC LIMIT 1",
            CONNECTOR_VERSION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConnectorVersionRecord::try_from).transpose()
    }

    async fn get_connector_versions(
        &self,
        id: Uuid,
    ) -> Result<Vec<ConnectorVersionRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ConnectorVersionRow>(&format!(
            "SELECT {} FROM connector_versions WHERE id = ? ORDER BY version ASC",
            CONNECTOR_VERSION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(ConnectorVersionRecord::try_from)
            .collect()
    }

    async fn upsert_connector_version(
        &self,
        record: &ConnectorVersionRecord,
    ) -> Result<(), CoreError> {
        let version = to_i64(record.version, "version")?;
        let mut tx = self.pool.begin().await?;
        let id = record.id.to_string();
        let updated_at = fmt_ts(record.updated_at);

        if record.state == ConnectorVersionState::Primary {
            sqlx::query(
                r#"
                UPDATE connector_versions
                SET state = 'active', updated_at = ?
                WHERE id = ? AND state = 'primary' AND version != ?
                "#,
            )
            .bind(&updated_at)
            .bind(&id)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO connector_versions
                (id, version, namespace, state, labels, hash, encrypted_definition, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id, version) DO UPDATE SET
                namespace = excluded.namespace,
                state = excluded.state,
                labels = excluded.labels,
                hash = excluded.hash,
                encrypted_definition = excluded.encrypted_definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(version)
        .bind(&record.namespace)
        .bind(record.state.as_str())
        .bind(encode_labels(&record.labels)?)
        .bind(&record.hash)
        .bind(&record.encrypted_definition)
        .bind(fmt_ts(record.created_at))
        .bind(&updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_connector_ids_by_labels(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<Uuid>, CoreError> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT DISTINCT id FROM connector_versions WHERE 1 = 1");
        push_selector(&mut qb, "labels", selector);
        qb.push(" ORDER BY id");

        let ids: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn list_connectors(
        &self,
        filter: &ConnectorFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<ConnectorSummaryRecord>, CoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT cv.id, cv.version, cv.namespace, cv.state, cv.labels, cv.hash,
                   cv.encrypted_definition, cv.created_at, cv.updated_at,
                   agg.total_versions, agg.states
            FROM connector_versions cv
            JOIN (
                SELECT id,
                       COUNT(*) AS total_versions,
                       GROUP_CONCAT(DISTINCT state) AS states,
                       COALESCE(MAX(CASE WHEN state = 'primary' THEN version END), MAX(version)) AS rep_version
                FROM connector_versions
                GROUP BY id
            ) agg ON agg.id = cv.id AND agg.rep_version = cv.version
            WHERE 1 = 1
            "#,
        );

        if let Some(after) = after {
            qb.push(" AND cv.id > ");
            qb.push_bind(after.to_string());
        }
        if let Some(matcher) = &filter.namespace {
            push_namespace(&mut qb, "cv.namespace", matcher);
        }
        push_selector(&mut qb, "cv.labels", &filter.selector);
        if !filter.states.is_empty() {
            qb.push(" AND EXISTS (SELECT 1 FROM connector_versions s WHERE s.id = cv.id");
            let states: Vec<&'static str> = filter.states.iter().map(|s| s.as_str()).collect();
            push_in(&mut qb, "s.state", &states);
            qb.push(")");
        }
        qb.push(" ORDER BY cv.id LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb
            .build_query_as::<ConnectorSummaryRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(ConnectorSummaryRecord::try_from)
            .collect()
    }

    // ----- connections -----

    async fn create_connection(&self, record: &ConnectionRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO connections
                (id, namespace, state, connector_id, connector_version, labels, created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.namespace)
        .bind(record.state.as_str())
        .bind(record.connector_id.to_string())
        .bind(to_i64(record.connector_version, "connector_version")?)
        .bind(encode_labels(&record.labels)?)
        .bind(fmt_ts(record.created_at))
        .bind(fmt_ts(record.updated_at))
        .bind(record.deleted_at.map(fmt_ts))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<ConnectionRecord>, CoreError> {
        let row = sqlx::query_as::<_, ConnectionRow>(&format!(
            "SELECT {} FROM connections WHERE id = ? AND deleted_at IS NULL",
            CONNECTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConnectionRecord::try_from).transpose()
    }

    async fn update_connection_state(
        &self,
        id: Uuid,
        from: &[ConnectionState],
        to: ConnectionState,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE connections SET state = ");
        qb.push_bind(to.as_str());
        qb.push(", updated_at = ");
        qb.push_bind(fmt_ts(now));
        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());
        qb.push(" AND deleted_at IS NULL");
        let from: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        push_in(&mut qb, "state", &from);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_connection(&self, id: Uuid) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;
        let id = id.to_string();

        sqlx::query("DELETE FROM probe_outcomes WHERE connection_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_connections(
        &self,
        filter: &ConnectionFilter,
        after: Option<ConnectionKey>,
        limit: usize,
    ) -> Result<Vec<ConnectionRecord>, CoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM connections WHERE deleted_at IS NULL",
            CONNECTION_COLUMNS
        ));

        if let Some(key) = after {
            let created_at = fmt_ts(key.created_at);
            qb.push(" AND (created_at > ");
            qb.push_bind(created_at.clone());
            qb.push(" OR (created_at = ");
            qb.push_bind(created_at);
            qb.push(" AND id > ");
            qb.push_bind(key.id.to_string());
            qb.push("))");
        }
        if let Some(matcher) = &filter.namespace {
            push_namespace(&mut qb, "namespace", matcher);
        }
        if !filter.states.is_empty() {
            let states: Vec<&'static str> = filter.states.iter().map(|s| s.as_str()).collect();
            push_in(&mut qb, "state", &states);
        }
        if let Some(connector_id) = filter.connector_id {
            qb.push(" AND connector_id = ");
            qb.push_bind(connector_id.to_string());
        }
        push_selector(&mut qb, "labels", &filter.selector);
        qb.push(" ORDER BY created_at, id LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb
            .build_query_as::<ConnectionRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ConnectionRecord::try_from).collect()
    }

    // ----- probe outcomes -----

    async fn record_probe_outcome(&self, outcome: &ProbeOutcomeRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO probe_outcomes
                (connection_id, probe_id, outcome, status_code, error, duration_ms, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(outcome.connection_id.to_string())
        .bind(&outcome.probe_id)
        .bind(outcome.outcome.as_str())
        .bind(outcome.status_code.map(i64::from))
        .bind(&outcome.error)
        .bind(outcome.duration_ms as i64)
        .bind(fmt_ts(outcome.started_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_probe_outcomes(
        &self,
        connection_id: Uuid,
        probe_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ProbeOutcomeRecord>, CoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT connection_id, probe_id, outcome, status_code, error, duration_ms, started_at \
             FROM probe_outcomes WHERE connection_id = ",
        );
        qb.push_bind(connection_id.to_string());
        if let Some(probe_id) = probe_id {
            qb.push(" AND probe_id = ");
            qb.push_bind(probe_id.to_string());
        }
        qb.push(" ORDER BY started_at DESC, id DESC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb
            .build_query_as::<ProbeOutcomeRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ProbeOutcomeRecord::try_from).collect()
    }

    // ----- named locks -----

    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CoreError::Database {
            operation: "lock".to_string(),
            details: format!("invalid lease duration: {}", e),
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ?4 OR locks.holder = excluded.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(fmt_ts(now + ttl))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOutcome;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn version_record(
        id: Uuid,
        version: u64,
        state: ConnectorVersionState,
        label_pairs: &[(&str, &str)],
    ) -> ConnectorVersionRecord {
        let now = Utc::now();
        ConnectorVersionRecord {
            id,
            version,
            namespace: "root".to_string(),
            state,
            labels: labels(label_pairs),
            hash: format!("h{}", version),
            encrypted_definition: "ciphertext".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn connection_record(connector_id: Uuid, namespace: &str) -> ConnectionRecord {
        let now = Utc::now();
        ConnectionRecord {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            state: ConnectionState::Created,
            connector_id,
            connector_version: 1,
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_namespace_is_idempotent() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let ns = Namespace::new("root", Labels::new());
        assert!(persistence.create_namespace(&ns).await.unwrap());
        assert!(!persistence.create_namespace(&ns).await.unwrap());

        let fetched = persistence.get_namespace("root").await.unwrap().unwrap();
        assert_eq!(fetched.path, "root");
        assert!(persistence.get_namespace("root.x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_namespaces_subtree() {
        let persistence = SqlitePersistence::new(test_pool().await);
        for path in ["root", "root.a", "root.a.b", "root.ab"] {
            persistence
                .create_namespace(&Namespace::new(path, Labels::new()))
                .await
                .unwrap();
        }

        let matcher: NamespaceMatcher = "root.a.**".parse().unwrap();
        let paths: Vec<String> = persistence
            .list_namespaces(Some(&matcher))
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.path)
            .collect();
        assert_eq!(paths, vec!["root.a", "root.a.b"]);
        assert_eq!(persistence.list_namespaces(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_upsert_primary_demotes_previous() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let id = Uuid::new_v4();

        persistence
            .upsert_connector_version(&version_record(id, 1, ConnectorVersionState::Primary, &[]))
            .await
            .unwrap();
        persistence
            .upsert_connector_version(&version_record(id, 2, ConnectorVersionState::Primary, &[]))
            .await
            .unwrap();

        let versions = persistence.get_connector_versions(id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].state, ConnectorVersionState::Active);
        assert_eq!(versions[1].state, ConnectorVersionState::Primary);

        let primary = persistence
            .get_connector_version_for_state(id, ConnectorVersionState::Primary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(primary.version, 2);
        assert_eq!(
            persistence
                .get_latest_connector_version(id)
                .await
                .unwrap()
                .unwrap()
                .version,
            2
        );
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_version() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let id = Uuid::new_v4();

        let mut record = version_record(id, 1, ConnectorVersionState::Draft, &[]);
        persistence.upsert_connector_version(&record).await.unwrap();
        record.hash = "changed".to_string();
        persistence.upsert_connector_version(&record).await.unwrap();

        let stored = persistence
            .get_connector_version(id, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.hash, "changed");
        assert_eq!(persistence.get_connector_versions(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_version_beyond_storable_range_rejected() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let id = Uuid::new_v4();
        let huge = i64::MAX as u64 + 1;

        let record = version_record(id, huge, ConnectorVersionState::Primary, &[]);
        let err = persistence
            .upsert_connector_version(&record)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(persistence.get_connector_versions(id).await.unwrap().is_empty());

        let err = persistence.get_connector_version(id, huge).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_second_draft_rejected_by_store() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let id = Uuid::new_v4();

        persistence
            .upsert_connector_version(&version_record(id, 1, ConnectorVersionState::Draft, &[]))
            .await
            .unwrap();
        let err = persistence
            .upsert_connector_version(&version_record(id, 2, ConnectorVersionState::Draft, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Database { .. }));
    }

    #[tokio::test]
    async fn test_find_connector_ids_by_labels() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let fake = Uuid::new_v4();
        let google = Uuid::new_v4();

        for v in 1..=2 {
            persistence
                .upsert_connector_version(&version_record(
                    fake,
                    v,
                    ConnectorVersionState::Primary,
                    &[("type", "fake")],
                ))
                .await
                .unwrap();
        }
        persistence
            .upsert_connector_version(&version_record(
                google,
                1,
                ConnectorVersionState::Primary,
                &[("type", "google"), ("tier", "gold")],
            ))
            .await
            .unwrap();

        let selector: LabelSelector = "type=fake".parse().unwrap();
        assert_eq!(
            persistence
                .find_connector_ids_by_labels(&selector)
                .await
                .unwrap(),
            vec![fake]
        );

        let selector: LabelSelector = "tier".parse().unwrap();
        assert_eq!(
            persistence
                .find_connector_ids_by_labels(&selector)
                .await
                .unwrap(),
            vec![google]
        );

        let selector: LabelSelector = "type!=fake".parse().unwrap();
        assert_eq!(
            persistence
                .find_connector_ids_by_labels(&selector)
                .await
                .unwrap(),
            vec![google]
        );

        let selector: LabelSelector = "!tier".parse().unwrap();
        assert_eq!(
            persistence
                .find_connector_ids_by_labels(&selector)
                .await
                .unwrap(),
            vec![fake]
        );
    }

    #[tokio::test]
    async fn test_list_connectors_aggregates() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        persistence
            .upsert_connector_version(&version_record(a, 1, ConnectorVersionState::Primary, &[]))
            .await
            .unwrap();
        persistence
            .upsert_connector_version(&version_record(a, 2, ConnectorVersionState::Primary, &[]))
            .await
            .unwrap();
        persistence
            .upsert_connector_version(&version_record(a, 3, ConnectorVersionState::Draft, &[]))
            .await
            .unwrap();
        persistence
            .upsert_connector_version(&version_record(b, 1, ConnectorVersionState::Draft, &[]))
            .await
            .unwrap();

        let all = persistence
            .list_connectors(&ConnectorFilter::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let summary_a = all.iter().find(|s| s.record.id == a).unwrap();
        assert_eq!(summary_a.record.version, 2);
        assert_eq!(summary_a.total_versions, 3);
        assert_eq!(
            summary_a.states,
            BTreeSet::from([
                ConnectorVersionState::Draft,
                ConnectorVersionState::Primary,
                ConnectorVersionState::Active,
            ])
        );

        let summary_b = all.iter().find(|s| s.record.id == b).unwrap();
        assert_eq!(summary_b.record.version, 1);

        let primaries = persistence
            .list_connectors(
                &ConnectorFilter {
                    states: vec![ConnectorVersionState::Primary],
                    ..Default::default()
                },
                None,
                10,
            )
            .await
            .unwrap();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].record.id, a);

        let first = &all[0].record.id;
        let rest = persistence
            .list_connectors(&ConnectorFilter::default(), Some(*first), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0].record.id, *first);
    }

    #[tokio::test]
    async fn test_connection_state_updates_are_conditional() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let connector_id = Uuid::new_v4();
        persistence
            .upsert_connector_version(&version_record(
                connector_id,
                1,
                ConnectorVersionState::Primary,
                &[],
            ))
            .await
            .unwrap();

        let conn = connection_record(connector_id, "root");
        persistence.create_connection(&conn).await.unwrap();

        let updated = persistence
            .update_connection_state(
                conn.id,
                &[ConnectionState::Disconnecting],
                ConnectionState::Disconnected,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!updated);

        let updated = persistence
            .update_connection_state(
                conn.id,
                &[ConnectionState::Created, ConnectionState::Ready],
                ConnectionState::Disconnecting,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(updated);

        let stored = persistence.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ConnectionState::Disconnecting);

        assert!(persistence.delete_connection(conn.id).await.unwrap());
        assert!(persistence.get_connection(conn.id).await.unwrap().is_none());
        assert!(!persistence.delete_connection(conn.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_connections_keyset_and_filters() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let connector_id = Uuid::new_v4();
        persistence
            .upsert_connector_version(&version_record(
                connector_id,
                1,
                ConnectorVersionState::Primary,
                &[],
            ))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for ns in ["root.a", "root.a.x", "root.b"] {
            let conn = connection_record(connector_id, ns);
            ids.push(conn.id);
            persistence.create_connection(&conn).await.unwrap();
        }

        let filter = ConnectionFilter {
            namespace: Some("root.a.**".parse().unwrap()),
            ..Default::default()
        };
        let page = persistence.list_connections(&filter, None, 1).await.unwrap();
        assert_eq!(page.len(), 1);

        let key = ConnectionKey {
            created_at: page[0].created_at,
            id: page[0].id,
        };
        let next = persistence
            .list_connections(&filter, Some(key), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_ne!(next[0].id, page[0].id);
        assert!(next[0].namespace.starts_with("root.a"));

        let all = persistence
            .list_connections(&ConnectionFilter::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_probe_outcomes_cascade_on_delete() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let connector_id = Uuid::new_v4();
        persistence
            .upsert_connector_version(&version_record(
                connector_id,
                1,
                ConnectorVersionState::Primary,
                &[],
            ))
            .await
            .unwrap();
        let conn = connection_record(connector_id, "root");
        persistence.create_connection(&conn).await.unwrap();

        for (probe_id, outcome) in [("ping", ProbeOutcome::Success), ("me", ProbeOutcome::Error)] {
            persistence
                .record_probe_outcome(&ProbeOutcomeRecord {
                    connection_id: conn.id,
                    probe_id: probe_id.to_string(),
                    outcome,
                    status_code: Some(200),
                    error: None,
                    duration_ms: 12,
                    started_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let pings = persistence
            .list_probe_outcomes(conn.id, Some("ping"), 10)
            .await
            .unwrap();
        assert_eq!(pings.len(), 1);
        assert_eq!(pings[0].outcome, ProbeOutcome::Success);
        assert_eq!(
            persistence
                .list_probe_outcomes(conn.id, None, 10)
                .await
                .unwrap()
                .len(),
            2
        );

        persistence.delete_connection(conn.id).await.unwrap();
        assert!(
            persistence
                .list_probe_outcomes(conn.id, None, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_lock_lease() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ttl = Duration::from_secs(60);

        assert!(persistence.try_acquire_lock("m", "a", ttl).await.unwrap());
        assert!(persistence.try_acquire_lock("m", "a", ttl).await.unwrap());
        assert!(!persistence.try_acquire_lock("m", "b", ttl).await.unwrap());

        persistence.release_lock("m", "b").await.unwrap();
        assert!(!persistence.try_acquire_lock("m", "b", ttl).await.unwrap());

        persistence.release_lock("m", "a").await.unwrap();
        assert!(persistence.try_acquire_lock("m", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let persistence = SqlitePersistence::new(test_pool().await);

        assert!(
            persistence
                .try_acquire_lock("m", "a", Duration::from_millis(1))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            persistence
                .try_acquire_lock("m", "b", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("authproxy.db");

        let persistence = SqlitePersistence::from_path(&path).await.unwrap();
        persistence
            .create_namespace(&Namespace::new("root", Labels::new()))
            .await
            .unwrap();
        assert!(path.exists());
    }
}
