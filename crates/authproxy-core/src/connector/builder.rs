// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Builder for [`ConnectorVersion`].

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::{
    ConnectorDefinition, ConnectorVersion, ConnectorVersionId, ConnectorVersionRecord,
    ConnectorVersionState,
};
use crate::encrypt::EncryptService;
use crate::error::{CoreError, Result};
use crate::labels::Labels;
use crate::namespace::validate_path;

/// Assembles a connector version from a definition plus explicit overrides.
///
/// Overrides win over the values carried in the definition. Unset values
/// default to a fresh id, version 1, state `primary`, and the `root`
/// namespace. The definition is encrypted exactly once per build.
///
/// # Example
///
/// ```ignore
/// let cv = ConnectorVersionBuilder::new(encrypt)
///     .definition(def)
///     .version(2)
///     .state(ConnectorVersionState::Draft)
///     .build()
///     .await?;
/// ```
pub struct ConnectorVersionBuilder {
    encrypt: Arc<dyn EncryptService>,
    definition: Option<ConnectorDefinition>,
    id: Option<Uuid>,
    version: Option<u64>,
    state: Option<ConnectorVersionState>,
    namespace: Option<String>,
    labels: Option<Labels>,
}

impl ConnectorVersionBuilder {
    /// Create an empty builder.
    pub fn new(encrypt: Arc<dyn EncryptService>) -> Self {
        Self {
            encrypt,
            definition: None,
            id: None,
            version: None,
            state: None,
            namespace: None,
            labels: None,
        }
    }

    /// Set the plaintext definition.
    pub fn definition(mut self, definition: ConnectorDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Override the connector id.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Override the version number.
    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Override the version state.
    pub fn state(mut self, state: ConnectorVersionState) -> Self {
        self.state = Some(state);
        self
    }

    /// Override the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Override the labels.
    pub fn labels(mut self, labels: Labels) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Build the version.
    pub async fn build(self) -> Result<ConnectorVersion> {
        let mut def = self.definition.ok_or(CoreError::NilDefinition)?;

        let id = self.id.or(def.id).unwrap_or_else(Uuid::new_v4);
        let version = self.version.or(def.version).unwrap_or(1);
        let state = self.state.or(def.state).unwrap_or_default();
        let namespace = self
            .namespace
            .unwrap_or_else(|| def.namespace_or_root().to_string());
        if let Some(labels) = self.labels {
            def.labels = labels;
        }

        if version == 0 {
            return Err(CoreError::validation("version", "version must be >= 1"));
        }
        validate_path(&namespace)?;

        def.id = Some(id);
        def.version = Some(version);
        def.state = Some(state);
        def.namespace = Some(namespace.clone());

        let hash = def.content_hash()?;
        let identity = ConnectorVersionId { id, version };
        let encrypted_definition = self
            .encrypt
            .encrypt_string_for_connector(identity, &def.canonical_json()?)
            .await?;

        let now = Utc::now();
        let record = ConnectorVersionRecord {
            id,
            version,
            namespace,
            state,
            labels: def.labels.clone(),
            hash,
            encrypted_definition,
            created_at: now,
            updated_at: now,
        };

        Ok(ConnectorVersion::with_definition(record, self.encrypt, def))
    }
}
