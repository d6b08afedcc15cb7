// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector version operations of [`CoreService`].

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{
    Connector, ConnectorDefinition, ConnectorVersion, ConnectorVersionBuilder, ConnectorVersionId,
    ConnectorVersionState,
};
use crate::error::{CoreError, Result};
use crate::labels::{LabelSelector, Labels};
use crate::namespace::NamespaceMatcher;
use crate::pagination::{Page, clamp_limit, decode_cursor, encode_cursor};
use crate::persistence::{ConnectorFilter, ConnectorSummaryRecord};
use crate::service::CoreService;

impl CoreService {
    /// Fetch one connector version.
    pub async fn get_connector_version(
        &self,
        id: Uuid,
        version: u64,
    ) -> Result<Arc<ConnectorVersion>> {
        let record = self
            .store()
            .get_connector_version(id, version)
            .await?
            .ok_or_else(|| {
                CoreError::not_found("connector version", ConnectorVersionId { id, version })
            })?;
        Ok(Arc::new(self.wrap_version(record)))
    }

    /// Fetch the version of `id` currently in `state`.
    pub async fn get_connector_version_for_state(
        &self,
        id: Uuid,
        state: ConnectorVersionState,
    ) -> Result<Arc<ConnectorVersion>> {
        let record = self
            .store()
            .get_connector_version_for_state(id, state)
            .await?
            .ok_or_else(|| CoreError::not_found("connector version", format!("{}@{}", id, state)))?;
        Ok(Arc::new(self.wrap_version(record)))
    }

    /// All versions of `id`, ascending by version.
    pub async fn get_connector_versions(&self, id: Uuid) -> Result<Vec<Arc<ConnectorVersion>>> {
        let records = self.store().get_connector_versions(id).await?;
        Ok(records
            .into_iter()
            .map(|r| Arc::new(self.wrap_version(r)))
            .collect())
    }

    /// Aggregate view over every version of `id`.
    pub async fn get_connector(&self, id: Uuid) -> Result<Connector> {
        let records = self.store().get_connector_versions(id).await?;
        let total_versions = records.len() as u64;
        let states = records.iter().map(|r| r.state).collect();

        let representative = match records
            .iter()
            .position(|r| r.state == ConnectorVersionState::Primary)
        {
            Some(pos) => records.into_iter().nth(pos),
            None => records.into_iter().last(),
        }
        .ok_or_else(|| CoreError::not_found("connector", id))?;

        Ok(Connector {
            version: Arc::new(self.wrap_version(representative)),
            total_versions,
            states,
        })
    }

    /// Start a connector listing.
    pub fn list_connectors_builder(&self) -> ListConnectorsBuilder {
        ListConnectorsBuilder {
            service: self.clone(),
            query: ConnectorsQuery::default(),
        }
    }

    /// Resume a connector listing from a page cursor.
    pub fn list_connectors_from_cursor(&self, cursor: &str) -> Result<ListConnectorsCursor> {
        let doc: ConnectorsCursor = decode_cursor(cursor)?;
        Ok(ListConnectorsCursor {
            service: self.clone(),
            query: doc.query,
            after: doc.after,
        })
    }

    /// Create the next version of a connector.
    ///
    /// Uses the definition's id or a fresh one, and its state or `primary`.
    /// An explicit `version` in the definition must be the next free number.
    pub async fn create_connector_version(
        &self,
        definition: ConnectorDefinition,
    ) -> Result<Arc<ConnectorVersion>> {
        let id = definition.id.unwrap_or_else(Uuid::new_v4);
        let state = definition.state.unwrap_or_default();
        self.create_next_version(id, definition, state).await
    }

    /// Create a draft as the next version of `id`.
    ///
    /// Fails with `DraftAlreadyExists` if the connector already has a draft.
    pub async fn create_draft_connector_version(
        &self,
        id: Uuid,
        definition: ConnectorDefinition,
    ) -> Result<Arc<ConnectorVersion>> {
        self.create_next_version(id, definition, ConnectorVersionState::Draft)
            .await
    }

    /// Replace the definition of a draft version.
    ///
    /// The id, version, state and namespace of the draft are kept.
    pub async fn update_draft_connector_version(
        &self,
        id: Uuid,
        version: u64,
        definition: ConnectorDefinition,
    ) -> Result<Arc<ConnectorVersion>> {
        definition.validate()?;
        let record = self
            .store()
            .get_connector_version(id, version)
            .await?
            .ok_or_else(|| {
                CoreError::not_found("connector version", ConnectorVersionId { id, version })
            })?;
        if record.state.is_published() {
            return Err(CoreError::NotDraft {
                id,
                version,
                state: record.state,
            });
        }

        let mut cv = self.wrap_version(record);
        cv.set_definition(definition).await?;
        self.store().upsert_connector_version(cv.record()).await?;

        info!(connector_id = %id, version, hash = %cv.hash(), "Updated draft connector version");
        Ok(Arc::new(cv))
    }

    /// The current draft of `id`, creating one from the primary (or latest)
    /// version when none exists.
    pub async fn get_or_create_draft_connector_version(
        &self,
        id: Uuid,
    ) -> Result<Arc<ConnectorVersion>> {
        if let Some(draft) = self
            .store()
            .get_connector_version_for_state(id, ConnectorVersionState::Draft)
            .await?
        {
            return Ok(Arc::new(self.wrap_version(draft)));
        }

        let base = match self
            .store()
            .get_connector_version_for_state(id, ConnectorVersionState::Primary)
            .await?
        {
            Some(primary) => primary,
            None => self
                .store()
                .get_latest_connector_version(id)
                .await?
                .ok_or_else(|| CoreError::not_found("connector", id))?,
        };

        let base = self.wrap_version(base);
        let mut definition = base.definition().await?.as_ref().clone();
        definition.version = None;
        definition.state = None;

        self.create_next_version(id, definition, ConnectorVersionState::Draft)
            .await
    }

    /// Promote the draft of `id` to `primary`.
    ///
    /// The previous primary is demoted to `active` by the store.
    pub async fn publish_draft_connector_version(
        &self,
        id: Uuid,
    ) -> Result<Arc<ConnectorVersion>> {
        let mut record = self
            .store()
            .get_connector_version_for_state(id, ConnectorVersionState::Draft)
            .await?
            .ok_or_else(|| CoreError::not_found("connector draft", id))?;

        record.state = ConnectorVersionState::Primary;
        record.updated_at = Utc::now();
        self.store().upsert_connector_version(&record).await?;

        info!(connector_id = %id, version = record.version, "Published connector version");
        Ok(Arc::new(self.wrap_version(record)))
    }

    async fn create_next_version(
        &self,
        id: Uuid,
        definition: ConnectorDefinition,
        state: ConnectorVersionState,
    ) -> Result<Arc<ConnectorVersion>> {
        definition.validate()?;

        let next = self
            .store()
            .get_latest_connector_version(id)
            .await?
            .map_or(1, |latest| latest.version + 1);
        if let Some(requested) = definition.version
            && requested != next
        {
            return Err(CoreError::validation(
                "version",
                format!(
                    "next version of connector '{}' is {}, got {}",
                    id, next, requested
                ),
            ));
        }

        if state == ConnectorVersionState::Draft
            && let Some(draft) = self
                .store()
                .get_connector_version_for_state(id, ConnectorVersionState::Draft)
                .await?
        {
            return Err(CoreError::DraftAlreadyExists {
                id,
                version: draft.version,
            });
        }

        self.ensure_namespace_ancestor_path(definition.namespace_or_root(), &Labels::new())
            .await?;

        let cv = ConnectorVersionBuilder::new(self.encrypt_service().clone())
            .definition(definition)
            .id(id)
            .version(next)
            .state(state)
            .build()
            .await?;
        self.store().upsert_connector_version(cv.record()).await?;

        info!(
            connector_id = %id,
            version = next,
            state = %state,
            hash = %cv.hash(),
            "Created connector version"
        );
        Ok(Arc::new(cv))
    }

    fn summary_to_connector(&self, summary: ConnectorSummaryRecord) -> Connector {
        Connector {
            version: Arc::new(self.wrap_version(summary.record)),
            total_versions: summary.total_versions,
            states: summary.states,
        }
    }
}

// ============================================================================
// Listing
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ConnectorsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<NamespaceMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    states: Vec<ConnectorVersionState>,
    #[serde(default, skip_serializing_if = "LabelSelector::is_empty")]
    selector: LabelSelector,
    #[serde(default)]
    limit: usize,
}

impl ConnectorsQuery {
    fn filter(&self) -> ConnectorFilter {
        ConnectorFilter {
            namespace: self.namespace.clone(),
            states: self.states.clone(),
            selector: self.selector.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ConnectorsCursor {
    query: ConnectorsQuery,
    after: Uuid,
}

async fn fetch_connectors(
    service: &CoreService,
    query: &ConnectorsQuery,
    after: Option<Uuid>,
) -> Result<Page<Connector>> {
    let limit = clamp_limit(query.limit);
    let mut rows = service
        .store()
        .list_connectors(&query.filter(), after, limit + 1)
        .await?;

    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let cursor = match rows.last() {
        Some(last) if has_more => Some(encode_cursor(&ConnectorsCursor {
            query: query.clone(),
            after: last.record.id,
        })?),
        _ => None,
    };

    Ok(Page {
        items: rows
            .into_iter()
            .map(|s| service.summary_to_connector(s))
            .collect(),
        cursor,
    })
}

async fn enumerate_connectors<F>(
    service: &CoreService,
    query: &ConnectorsQuery,
    mut after: Option<Uuid>,
    mut f: F,
) -> Result<()>
where
    F: FnMut(Connector) -> ControlFlow<()>,
{
    loop {
        let page = fetch_connectors(service, query, after).await?;
        let has_more = page.has_more();
        let mut last = None;
        for connector in page.items {
            last = Some(connector.id());
            if f(connector).is_break() {
                return Ok(());
            }
        }
        match last {
            Some(id) if has_more => after = Some(id),
            _ => return Ok(()),
        }
    }
}

/// Connector listing under construction.
///
/// Connectors are ordered by id; each item carries the primary version (or
/// the latest when no primary exists).
#[derive(Clone)]
pub struct ListConnectorsBuilder {
    service: CoreService,
    query: ConnectorsQuery,
}

impl ListConnectorsBuilder {
    /// Restrict to a namespace or namespace subtree.
    pub fn for_namespace(mut self, matcher: NamespaceMatcher) -> Self {
        self.query.namespace = Some(matcher);
        self
    }

    /// Only connectors having a version in one of `states`.
    pub fn with_states(mut self, states: impl IntoIterator<Item = ConnectorVersionState>) -> Self {
        self.query.states = states.into_iter().collect();
        self
    }

    /// Only connectors whose version labels match `selector`.
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.query.selector = selector;
        self
    }

    /// Page size.
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = limit;
        self
    }

    /// Fetch the first page.
    pub async fn fetch_page(&self) -> Result<Page<Connector>> {
        fetch_connectors(&self.service, &self.query, None).await
    }

    /// Visit every matching connector until `f` breaks.
    pub async fn enumerate<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(Connector) -> ControlFlow<()>,
    {
        enumerate_connectors(&self.service, &self.query, None, f).await
    }
}

/// Connector listing resumed from a cursor.
#[derive(Clone)]
pub struct ListConnectorsCursor {
    service: CoreService,
    query: ConnectorsQuery,
    after: Uuid,
}

impl ListConnectorsCursor {
    /// Fetch the page following the cursor.
    pub async fn fetch_page(&self) -> Result<Page<Connector>> {
        fetch_connectors(&self.service, &self.query, Some(self.after)).await
    }

    /// Visit every remaining connector until `f` breaks.
    pub async fn enumerate<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(Connector) -> ControlFlow<()>,
    {
        enumerate_connectors(&self.service, &self.query, Some(self.after), f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{definition, service};

    #[tokio::test]
    async fn test_create_and_get_connector_version() {
        let (svc, _) = service().await;
        let cv = svc
            .create_connector_version(definition("fake", "Fake"))
            .await
            .unwrap();
        assert_eq!(cv.version(), 1);
        assert_eq!(cv.state(), ConnectorVersionState::Primary);

        let loaded = svc.get_connector_version(cv.id(), 1).await.unwrap();
        assert_eq!(loaded.hash(), cv.hash());
        assert_eq!(loaded.definition().await.unwrap().display_name, "Fake");

        let err = svc.get_connector_version(cv.id(), 2).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_next_version_demotes_primary() {
        let (svc, _) = service().await;
        let v1 = svc
            .create_connector_version(definition("fake", "Fake"))
            .await
            .unwrap();

        let mut def = definition("fake", "Fake v2");
        def.id = Some(v1.id());
        let v2 = svc.create_connector_version(def).await.unwrap();
        assert_eq!(v2.version(), 2);

        let versions = svc.get_connector_versions(v1.id()).await.unwrap();
        let states: Vec<_> = versions.iter().map(|v| v.state()).collect();
        assert_eq!(
            states,
            vec![ConnectorVersionState::Active, ConnectorVersionState::Primary]
        );

        let connector = svc.get_connector(v1.id()).await.unwrap();
        assert_eq!(connector.total_versions, 2);
        assert_eq!(connector.version.version(), 2);
        assert!(connector.has_state(ConnectorVersionState::Active));
    }

    #[tokio::test]
    async fn test_explicit_version_must_not_skip() {
        let (svc, _) = service().await;
        let mut def = definition("fake", "Fake");
        def.version = Some(3);
        let err = svc.create_connector_version(def).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_draft_lifecycle() {
        let (svc, _) = service().await;
        let v1 = svc
            .create_connector_version(definition("fake", "Fake"))
            .await
            .unwrap();
        let id = v1.id();

        let draft = svc.get_or_create_draft_connector_version(id).await.unwrap();
        assert_eq!(draft.version(), 2);
        assert_eq!(draft.state(), ConnectorVersionState::Draft);
        assert_eq!(draft.hash(), v1.hash());

        let again = svc.get_or_create_draft_connector_version(id).await.unwrap();
        assert_eq!(again.version(), 2);

        let err = svc
            .create_draft_connector_version(id, definition("fake", "Other"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DraftAlreadyExists { version: 2, .. }));

        let updated = svc
            .update_draft_connector_version(id, 2, definition("fake", "Fake v2"))
            .await
            .unwrap();
        assert_ne!(updated.hash(), v1.hash());
        assert_eq!(updated.definition().await.unwrap().display_name, "Fake v2");

        let err = svc
            .update_draft_connector_version(id, 1, definition("fake", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotDraft { version: 1, .. }));

        let published = svc.publish_draft_connector_version(id).await.unwrap();
        assert_eq!(published.state(), ConnectorVersionState::Primary);
        assert_eq!(
            published.definition().await.unwrap().state,
            Some(ConnectorVersionState::Primary)
        );
        let old = svc.get_connector_version(id, 1).await.unwrap();
        assert_eq!(old.state(), ConnectorVersionState::Active);

        let err = svc.publish_draft_connector_version(id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_or_create_draft_unknown_connector() {
        let (svc, _) = service().await;
        let err = svc
            .get_or_create_draft_connector_version(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_connectors_pages() {
        let (svc, _) = service().await;
        for kind in ["a", "b", "c"] {
            svc.create_connector_version(definition(kind, kind))
                .await
                .unwrap();
        }

        let first = svc
            .list_connectors_builder()
            .limit(2)
            .fetch_page()
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.cursor.clone().unwrap();

        let second = svc
            .list_connectors_from_cursor(&cursor)
            .unwrap()
            .fetch_page()
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(!second.has_more());

        let mut seen = Vec::new();
        svc.list_connectors_builder()
            .limit(1)
            .enumerate(|c| {
                seen.push(c.id());
                ControlFlow::Continue(())
            })
            .await
            .unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_list_connectors_by_selector() {
        let (svc, _) = service().await;
        svc.create_connector_version(definition("google", "Google"))
            .await
            .unwrap();
        svc.create_connector_version(definition("github", "GitHub"))
            .await
            .unwrap();

        let page = svc
            .list_connectors_builder()
            .with_selector("type=github".parse().unwrap())
            .fetch_page()
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(
            page.items[0].version.labels().get("type"),
            Some(&"github".to_string())
        );

        assert!(svc.list_connectors_from_cursor("%%%").is_err());
    }
}
