// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection lifecycle operations of [`CoreService`].

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionEntity, ConnectionRecord, ConnectionState};
use crate::connector::{ConnectorVersion, ConnectorVersionId};
use crate::error::{CoreError, Result};
use crate::labels::{LabelSelector, Labels, validate_labels};
use crate::namespace::{NamespaceMatcher, is_same_or_child, validate_path};
use crate::pagination::{Page, clamp_limit, decode_cursor, encode_cursor};
use crate::persistence::{ConnectionFilter, ConnectionKey};
use crate::probe::{ProbeInvocation, ProbeOutcome, ProbeOutcomeRecord};
use crate::service::CoreService;
use crate::tasks::{
    DisconnectConnectionPayload, EnqueueOptions, TASK_TYPE_DISCONNECT_CONNECTION, Task, TaskInfo,
};

impl CoreService {
    /// Create a connection bound to `connector_version`.
    ///
    /// `namespace` must be the connector's namespace or one of its
    /// descendants; missing ancestors are created. Drafts cannot be bound.
    pub async fn create_connection(
        &self,
        namespace: &str,
        connector_version: Arc<ConnectorVersion>,
        labels: Labels,
    ) -> Result<ConnectionEntity> {
        validate_path(namespace)?;
        validate_labels(&labels)?;
        if !is_same_or_child(connector_version.namespace(), namespace) {
            return Err(CoreError::validation(
                "namespace",
                format!(
                    "namespace '{}' is outside connector namespace '{}'",
                    namespace,
                    connector_version.namespace()
                ),
            ));
        }
        if !connector_version.state().is_published() {
            return Err(CoreError::validation(
                "connector_version",
                format!(
                    "connector version {} is a draft and cannot back a connection",
                    connector_version.identity()
                ),
            ));
        }

        self.ensure_namespace_ancestor_path(namespace, &Labels::new())
            .await?;

        // Stored timestamps carry microseconds; match them so cursors built
        // from this record line up with listed rows.
        let now = Utc::now().trunc_subsecs(6);
        let record = ConnectionRecord {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            state: ConnectionState::Created,
            connector_id: connector_version.id(),
            connector_version: connector_version.version(),
            labels,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store().create_connection(&record).await?;

        info!(
            connection_id = %record.id,
            namespace = %record.namespace,
            connector = %connector_version.identity(),
            "Created connection"
        );
        Ok(ConnectionEntity::new(record, connector_version))
    }

    /// Fetch a connection with its bound connector version.
    pub async fn get_connection(&self, id: Uuid) -> Result<ConnectionEntity> {
        let record = self
            .store()
            .get_connection(id)
            .await?
            .ok_or_else(|| CoreError::not_found("connection", id))?;
        let cv = self
            .get_connector_version(record.connector_id, record.connector_version)
            .await?;
        Ok(ConnectionEntity::new(record, cv))
    }

    /// Begin disconnecting a connection.
    ///
    /// Moves the connection to `disconnecting` and enqueues the teardown
    /// task; the returned handle tracks that task. Fails with `NotFound` if
    /// the connection does not exist.
    pub async fn disconnect_connection(&self, id: Uuid) -> Result<TaskInfo> {
        let mut conn = self.get_connection(id).await?;
        conn.set_state(self.store().as_ref(), ConnectionState::Disconnecting)
            .await?;

        let task = Task::new(
            TASK_TYPE_DISCONNECT_CONNECTION,
            &DisconnectConnectionPayload { connection_id: id },
        )?;
        let info = self
            .queue()
            .enqueue(
                task,
                EnqueueOptions::default().retention(self.disconnect_retention()),
            )
            .await?;

        info!(connection_id = %id, task_id = %info.id, "Enqueued connection disconnect");
        Ok(info)
    }

    /// Start a connection listing.
    pub fn list_connections_builder(&self) -> ListConnectionsBuilder {
        ListConnectionsBuilder {
            service: self.clone(),
            query: ConnectionsQuery::default(),
        }
    }

    /// Resume a connection listing from a page cursor.
    pub fn list_connections_from_cursor(&self, cursor: &str) -> Result<ListConnectionsCursor> {
        let doc: ConnectionsCursor = decode_cursor(cursor)?;
        Ok(ListConnectionsCursor {
            service: self.clone(),
            query: doc.query,
            after: ConnectionKey {
                created_at: doc.after_created_at,
                id: doc.after_id,
            },
        })
    }

    /// Run one probe of a connection and record its outcome.
    ///
    /// Probes without an executor and connections that are no longer live
    /// yield `unknown` without recording anything.
    pub async fn invoke_probe(
        &self,
        connection_id: Uuid,
        probe_id: &str,
    ) -> Result<ProbeOutcomeRecord> {
        let conn = self.get_connection(connection_id).await?;
        let probe = conn.probe(probe_id).await?;
        let started_at = Utc::now().trunc_subsecs(6);

        let unknown = ProbeOutcomeRecord {
            connection_id,
            probe_id: probe.id.clone(),
            outcome: ProbeOutcome::Unknown,
            status_code: None,
            error: None,
            duration_ms: 0,
            started_at,
        };

        if !conn.state().is_live() {
            debug!(connection_id = %connection_id, probe_id, state = %conn.state(), "Skipping probe of connection that is not live");
            return Ok(unknown);
        }

        let (request, via_proxy) = match &probe.invocation {
            ProbeInvocation::HttpDirect(request) => (request, false),
            ProbeInvocation::HttpViaProxy(request) => (request, true),
            ProbeInvocation::Passthrough => {
                debug!(connection_id = %connection_id, probe_id, "Probe has no executor");
                return Ok(unknown);
            }
        };

        let start = Instant::now();
        let (outcome, status_code, error) =
            match self.request_factory().new_request(&conn, request, via_proxy).await {
                Ok(builder) => match builder.send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        (ProbeOutcome::from_status(status), Some(status), None)
                    }
                    Err(e) => (ProbeOutcome::Error, None, Some(e.to_string())),
                },
                Err(e) if e.is_retriable() => return Err(e),
                Err(e) => (ProbeOutcome::Error, None, Some(e.to_string())),
            };

        let record = ProbeOutcomeRecord {
            outcome,
            status_code,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
            ..unknown
        };
        self.store().record_probe_outcome(&record).await?;

        match record.outcome {
            ProbeOutcome::Success => {
                info!(connection_id = %connection_id, probe_id, duration_ms = record.duration_ms, "Probe succeeded")
            }
            _ => warn!(
                connection_id = %connection_id,
                probe_id,
                outcome = %record.outcome,
                status_code = ?record.status_code,
                error = ?record.error,
                "Probe failed"
            ),
        }
        Ok(record)
    }

    /// Most recent probe outcomes of a connection, newest first.
    pub async fn list_probe_outcomes(
        &self,
        connection_id: Uuid,
        probe_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ProbeOutcomeRecord>> {
        self.store()
            .list_probe_outcomes(connection_id, probe_id, clamp_limit(limit))
            .await
    }
}

// ============================================================================
// Listing
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ConnectionsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<NamespaceMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    states: Vec<ConnectionState>,
    #[serde(default, skip_serializing_if = "LabelSelector::is_empty")]
    selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connector_id: Option<Uuid>,
    #[serde(default)]
    limit: usize,
}

impl ConnectionsQuery {
    fn filter(&self) -> ConnectionFilter {
        ConnectionFilter {
            namespace: self.namespace.clone(),
            states: self.states.clone(),
            selector: self.selector.clone(),
            connector_id: self.connector_id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ConnectionsCursor {
    query: ConnectionsQuery,
    after_created_at: DateTime<Utc>,
    after_id: Uuid,
}

async fn fetch_connections(
    service: &CoreService,
    query: &ConnectionsQuery,
    after: Option<ConnectionKey>,
) -> Result<Page<ConnectionEntity>> {
    let limit = clamp_limit(query.limit);
    let mut rows = service
        .store()
        .list_connections(&query.filter(), after, limit + 1)
        .await?;

    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let cursor = match rows.last() {
        Some(last) if has_more => Some(encode_cursor(&ConnectionsCursor {
            query: query.clone(),
            after_created_at: last.created_at,
            after_id: last.id,
        })?),
        _ => None,
    };

    // Connections of one page usually share a handful of connector versions.
    let mut versions: HashMap<ConnectorVersionId, Arc<ConnectorVersion>> = HashMap::new();
    let mut items = Vec::with_capacity(rows.len());
    for record in rows {
        let key = record.connector_version_id();
        let cv = match versions.get(&key) {
            Some(cv) => cv.clone(),
            None => {
                let cv = service.get_connector_version(key.id, key.version).await?;
                versions.insert(key, cv.clone());
                cv
            }
        };
        items.push(ConnectionEntity::new(record, cv));
    }

    Ok(Page { items, cursor })
}

async fn enumerate_connections<F>(
    service: &CoreService,
    query: &ConnectionsQuery,
    mut after: Option<ConnectionKey>,
    mut f: F,
) -> Result<()>
where
    F: FnMut(ConnectionEntity) -> ControlFlow<()>,
{
    loop {
        let page = fetch_connections(service, query, after).await?;
        let has_more = page.has_more();
        let mut last = None;
        for conn in page.items {
            last = Some(ConnectionKey {
                created_at: conn.record().created_at,
                id: conn.id(),
            });
            if f(conn).is_break() {
                return Ok(());
            }
        }
        match last {
            Some(key) if has_more => after = Some(key),
            _ => return Ok(()),
        }
    }
}

/// Connection listing under construction, ordered by creation time.
#[derive(Clone)]
pub struct ListConnectionsBuilder {
    service: CoreService,
    query: ConnectionsQuery,
}

impl ListConnectionsBuilder {
    /// Restrict to a namespace or namespace subtree.
    pub fn for_namespace(mut self, matcher: NamespaceMatcher) -> Self {
        self.query.namespace = Some(matcher);
        self
    }

    /// Only connections in one of `states`.
    pub fn with_states(mut self, states: impl IntoIterator<Item = ConnectionState>) -> Self {
        self.query.states = states.into_iter().collect();
        self
    }

    /// Only connections whose labels match `selector`.
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.query.selector = selector;
        self
    }

    /// Only connections of one connector.
    pub fn for_connector(mut self, connector_id: Uuid) -> Self {
        self.query.connector_id = Some(connector_id);
        self
    }

    /// Page size.
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = limit;
        self
    }

    /// Fetch the first page.
    pub async fn fetch_page(&self) -> Result<Page<ConnectionEntity>> {
        fetch_connections(&self.service, &self.query, None).await
    }

    /// Visit every matching connection until `f` breaks.
    pub async fn enumerate<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(ConnectionEntity) -> ControlFlow<()>,
    {
        enumerate_connections(&self.service, &self.query, None, f).await
    }
}

/// Connection listing resumed from a cursor.
#[derive(Clone)]
pub struct ListConnectionsCursor {
    service: CoreService,
    query: ConnectionsQuery,
    after: ConnectionKey,
}

impl ListConnectionsCursor {
    /// Fetch the page following the cursor.
    pub async fn fetch_page(&self) -> Result<Page<ConnectionEntity>> {
        fetch_connections(&self.service, &self.query, Some(self.after)).await
    }

    /// Visit every remaining connection until `f` breaks.
    pub async fn enumerate<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(ConnectionEntity) -> ControlFlow<()>,
    {
        enumerate_connections(&self.service, &self.query, Some(self.after), f).await
    }
}
