// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Applying one definition to the store.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{MigrationAction, MigrationResult, precheck};
use crate::connector::{
    ConnectorDefinition, ConnectorVersionBuilder, ConnectorVersionRecord, ConnectorVersionState,
};
use crate::error::{CoreError, Result};
use crate::labels::Labels;
use crate::service::CoreService;

/// Resolve `definition` to an `(id, version, state)` target and write it.
pub(super) async fn apply_definition(
    service: &CoreService,
    index: usize,
    definition: &ConnectorDefinition,
) -> Result<MigrationResult> {
    let id = match definition.id {
        Some(id) => Some(id),
        None => {
            let (selector, matches) = precheck::lookup_by_labels(service, definition).await?;
            match matches.as_slice() {
                [] => None,
                [id] => Some(*id),
                _ => {
                    return Err(CoreError::validation(
                        "labels",
                        format!(
                            "definition #{} labels '{}' match {} connectors",
                            index,
                            selector,
                            matches.len()
                        ),
                    ));
                }
            }
        }
    };

    service
        .ensure_namespace_ancestor_path(definition.namespace_or_root(), &Labels::new())
        .await?;

    let hash = definition.content_hash()?;
    let state = definition.state.unwrap_or_default();

    let result = match (id, definition.version) {
        (Some(id), Some(version)) => {
            apply_explicit(service, index, definition, id, version, state, &hash).await?
        }
        (Some(id), None) => apply_latest(service, index, definition, id, state, &hash).await?,
        (None, version) => {
            let id = Uuid::new_v4();
            let version = version.unwrap_or(1);
            write_new(service, index, definition, id, version, state).await?
        }
    };

    match result.action {
        MigrationAction::Unchanged => debug!(
            index,
            connector_id = %result.id,
            version = result.version,
            "Connector definition unchanged"
        ),
        action => info!(
            index,
            connector_id = %result.id,
            version = result.version,
            state = %result.state,
            hash = %result.hash,
            ?action,
            "Connector definition applied"
        ),
    }
    Ok(result)
}

async fn apply_explicit(
    service: &CoreService,
    index: usize,
    definition: &ConnectorDefinition,
    id: Uuid,
    version: u64,
    state: ConnectorVersionState,
    hash: &str,
) -> Result<MigrationResult> {
    let store = service.store();

    let Some(existing) = store.get_connector_version(id, version).await? else {
        if let Some(latest) = store.get_latest_connector_version(id).await? {
            if version <= latest.version {
                return Err(CoreError::validation(
                    "version",
                    format!(
                        "connector {} version {} is not above latest {}",
                        id, version, latest.version
                    ),
                ));
            }
            if state == ConnectorVersionState::Draft
                && let Some(draft) = store
                    .get_connector_version_for_state(id, ConnectorVersionState::Draft)
                    .await?
            {
                return Err(CoreError::DraftAlreadyExists {
                    id,
                    version: draft.version,
                });
            }
        }
        return write_new(service, index, definition, id, version, state).await;
    };

    if existing.hash == hash {
        if existing.state == state {
            return Ok(unchanged(index, &existing));
        }
        if existing.state.is_published() && state == ConnectorVersionState::Draft {
            return Err(CoreError::NotDraft {
                id,
                version,
                state: existing.state,
            });
        }
        return change_state(service, index, existing, state).await;
    }

    if existing.state.is_published() {
        return Err(CoreError::PublishedVersionImmutable { id, version });
    }

    let mut result = write_new(service, index, definition, id, version, state).await?;
    result.action = MigrationAction::Updated;
    Ok(result)
}

async fn apply_latest(
    service: &CoreService,
    index: usize,
    definition: &ConnectorDefinition,
    id: Uuid,
    state: ConnectorVersionState,
    hash: &str,
) -> Result<MigrationResult> {
    let store = service.store();

    let Some(latest) = store.get_latest_connector_version(id).await? else {
        return write_new(service, index, definition, id, 1, state).await;
    };
    let base = match store.get_connector_version_for_state(id, state).await? {
        Some(record) => record,
        None => latest.clone(),
    };

    if base.hash == hash {
        if base.state == state {
            return Ok(unchanged(index, &base));
        }
        if !base.state.is_published() || state.is_published() {
            return change_state(service, index, base, state).await;
        }
    }

    if base.state == ConnectorVersionState::Draft && state == ConnectorVersionState::Draft {
        let mut result = write_new(service, index, definition, id, base.version, state).await?;
        result.action = MigrationAction::Updated;
        return Ok(result);
    }

    if state == ConnectorVersionState::Draft
        && let Some(draft) = store
            .get_connector_version_for_state(id, ConnectorVersionState::Draft)
            .await?
    {
        return Err(CoreError::DraftAlreadyExists {
            id,
            version: draft.version,
        });
    }

    write_new(service, index, definition, id, latest.version + 1, state).await
}

async fn write_new(
    service: &CoreService,
    index: usize,
    definition: &ConnectorDefinition,
    id: Uuid,
    version: u64,
    state: ConnectorVersionState,
) -> Result<MigrationResult> {
    let cv = ConnectorVersionBuilder::new(service.encrypt_service().clone())
        .definition(definition.clone())
        .id(id)
        .version(version)
        .state(state)
        .build()
        .await?;
    service.store().upsert_connector_version(cv.record()).await?;
    Ok(result_for(index, cv.record(), MigrationAction::Created))
}

async fn change_state(
    service: &CoreService,
    index: usize,
    mut record: ConnectorVersionRecord,
    state: ConnectorVersionState,
) -> Result<MigrationResult> {
    record.state = state;
    record.updated_at = Utc::now();
    service.store().upsert_connector_version(&record).await?;
    Ok(result_for(index, &record, MigrationAction::StateChanged))
}

fn unchanged(index: usize, record: &ConnectorVersionRecord) -> MigrationResult {
    result_for(index, record, MigrationAction::Unchanged)
}

fn result_for(
    index: usize,
    record: &ConnectorVersionRecord,
    action: MigrationAction,
) -> MigrationResult {
    MigrationResult {
        index,
        id: record.id,
        version: record.version,
        state: record.state,
        hash: record.hash.clone(),
        action,
    }
}
