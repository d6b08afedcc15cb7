// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector version record and its lazily decrypting wrapper.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ConnectorDefinition, ConnectorVersionId, ConnectorVersionState};
use crate::encrypt::EncryptService;
use crate::error::{CoreError, Result};
use crate::labels::Labels;
use crate::probe::Probe;

/// Persisted form of a connector version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorVersionRecord {
    /// Connector id.
    pub id: Uuid,
    /// Version number.
    pub version: u64,
    /// Owning namespace.
    pub namespace: String,
    /// Version state.
    pub state: ConnectorVersionState,
    /// Labels, stored in plaintext for querying.
    pub labels: Labels,
    /// Content hash of the definition.
    pub hash: String,
    /// Ciphertext of the canonical definition JSON.
    pub encrypted_definition: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ConnectorVersionRecord {
    /// Identity of this record.
    pub fn identity(&self) -> ConnectorVersionId {
        ConnectorVersionId {
            id: self.id,
            version: self.version,
        }
    }
}

/// A connector version bound to the encryption service that can open it.
///
/// The definition is decrypted on first access and cached for the lifetime
/// of this value. The store remains authoritative.
pub struct ConnectorVersion {
    record: ConnectorVersionRecord,
    encrypt: Arc<dyn EncryptService>,
    definition: RwLock<Option<Arc<ConnectorDefinition>>>,
}

impl ConnectorVersion {
    /// Wrap a record loaded from the store.
    pub fn from_record(record: ConnectorVersionRecord, encrypt: Arc<dyn EncryptService>) -> Self {
        Self {
            record,
            encrypt,
            definition: RwLock::new(None),
        }
    }

    /// Wrap a record whose plaintext definition is already known.
    pub(crate) fn with_definition(
        record: ConnectorVersionRecord,
        encrypt: Arc<dyn EncryptService>,
        definition: ConnectorDefinition,
    ) -> Self {
        Self {
            record,
            encrypt,
            definition: RwLock::new(Some(Arc::new(definition))),
        }
    }

    /// Connector id.
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    /// Version number.
    pub fn version(&self) -> u64 {
        self.record.version
    }

    /// Version state.
    pub fn state(&self) -> ConnectorVersionState {
        self.record.state
    }

    /// Owning namespace.
    pub fn namespace(&self) -> &str {
        &self.record.namespace
    }

    /// Labels.
    pub fn labels(&self) -> &Labels {
        &self.record.labels
    }

    /// Content hash.
    pub fn hash(&self) -> &str {
        &self.record.hash
    }

    /// Identity used for encryption and lookups.
    pub fn identity(&self) -> ConnectorVersionId {
        self.record.identity()
    }

    /// The underlying record.
    pub fn record(&self) -> &ConnectorVersionRecord {
        &self.record
    }

    /// Consume the wrapper, returning the record.
    pub fn into_record(self) -> ConnectorVersionRecord {
        self.record
    }

    /// The encryption service this version decrypts through.
    pub fn encrypt_service(&self) -> &Arc<dyn EncryptService> {
        &self.encrypt
    }

    /// The decrypted definition, decrypting on first call.
    pub async fn definition(&self) -> Result<Arc<ConnectorDefinition>> {
        if let Some(def) = self.definition.read().await.as_ref() {
            return Ok(def.clone());
        }

        let mut guard = self.definition.write().await;
        // Another task may have filled the cache while we waited for the lock.
        if let Some(def) = guard.as_ref() {
            return Ok(def.clone());
        }

        debug!(connector_id = %self.record.id, version = self.record.version, "Decrypting connector definition");
        let json = self
            .encrypt
            .decrypt_string_for_connector(self.identity(), &self.record.encrypted_definition)
            .await?;
        let mut def = serde_json::from_str::<ConnectorDefinition>(&json)?;
        // The stored state moves on demotion without re-encrypting.
        def.id = Some(self.record.id);
        def.version = Some(self.record.version);
        def.state = Some(self.record.state);
        def.namespace = Some(self.record.namespace.clone());
        let def = Arc::new(def);
        *guard = Some(def.clone());
        Ok(def)
    }

    /// Replace the definition of a draft version.
    ///
    /// Re-encrypts and re-hashes the record. Published versions are rejected.
    pub async fn set_definition(&mut self, mut definition: ConnectorDefinition) -> Result<()> {
        if self.record.state.is_published() {
            return Err(CoreError::NotDraft {
                id: self.record.id,
                version: self.record.version,
                state: self.record.state,
            });
        }

        definition.id = Some(self.record.id);
        definition.version = Some(self.record.version);
        definition.state = Some(self.record.state);
        definition.namespace = Some(self.record.namespace.clone());

        let hash = definition.content_hash()?;
        let encrypted = self
            .encrypt
            .encrypt_string_for_connector(self.identity(), &definition.canonical_json()?)
            .await?;

        self.record.labels = definition.labels.clone();
        self.record.hash = hash;
        self.record.encrypted_definition = encrypted;
        self.record.updated_at = Utc::now();
        *self.definition.get_mut() = Some(Arc::new(definition));
        Ok(())
    }

    /// Probes declared by the definition.
    pub async fn probes(&self) -> Result<Vec<Probe>> {
        let def = self.definition().await?;
        def.probes.iter().map(Probe::try_from).collect()
    }

    /// Look up one probe by id.
    pub async fn probe(&self, probe_id: &str) -> Result<Probe> {
        let def = self.definition().await?;
        match def.probe(probe_id) {
            Some(p) => Probe::try_from(p),
            None => Err(CoreError::not_found(
                "probe",
                format!("{}/{}", self.identity(), probe_id),
            )),
        }
    }
}

impl fmt::Debug for ConnectorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorVersion")
            .field("id", &self.record.id)
            .field("version", &self.record.version)
            .field("state", &self.record.state)
            .field("namespace", &self.record.namespace)
            .field("hash", &self.record.hash)
            .finish_non_exhaustive()
    }
}
