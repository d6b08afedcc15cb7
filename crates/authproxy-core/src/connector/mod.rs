// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connectors and connector versions.
//!
//! A connector is a declarative description of how to authenticate to a
//! third-party system. Each change produces a new [`ConnectorVersion`]; once a
//! version leaves the `draft` state its content is immutable. The plaintext
//! [`ConnectorDefinition`] is persisted only as ciphertext plus a short content
//! hash and the labels used for querying.

mod auth;
mod builder;
mod service;
mod version;

pub use auth::{
    ApiKeyPlacement, Auth, AuthApiKey, AuthOAuth2, AuthType, KeySource, OAuth2Endpoint, Scope,
};
pub use builder::ConnectorVersionBuilder;
pub use service::{ListConnectorsBuilder, ListConnectorsCursor};
pub use version::{ConnectorVersion, ConnectorVersionRecord};

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::labels::{Labels, subset, validate_labels};
use crate::namespace::{ROOT_NAMESPACE, validate_path};
use crate::probe::ProbeDefinition;

/// Number of hex characters of the SHA1 digest kept as the content hash.
pub const HASH_LENGTH: usize = 7;

/// Lifecycle state of a connector version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorVersionState {
    /// Editable, not yet published.
    Draft,
    /// The canonical version for new connections.
    #[default]
    Primary,
    /// Superseded but retained for existing connections.
    Active,
}

impl ConnectorVersionState {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Primary => "primary",
            Self::Active => "active",
        }
    }

    /// Whether the version has been published and is therefore immutable.
    pub fn is_published(&self) -> bool {
        !matches!(self, Self::Draft)
    }
}

impl FromStr for ConnectorVersionState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "primary" => Ok(Self::Primary),
            "active" => Ok(Self::Active),
            other => Err(CoreError::validation(
                "state",
                format!("unknown connector version state '{}'", other),
            )),
        }
    }
}

impl fmt::Display for ConnectorVersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one connector version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectorVersionId {
    /// Connector id.
    pub id: Uuid,
    /// Version number, starting at 1.
    pub version: u64,
}

impl fmt::Display for ConnectorVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Plaintext connector definition.
///
/// `id`, `version` and `state` are optional in declarative config; the
/// migration engine resolves them. Their values never contribute to the
/// content hash, so assigning them does not register as a content change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    /// Connector id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Explicit version number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Explicit version state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectorVersionState>,
    /// Owning namespace; `root` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels, including the identifying labels.
    #[serde(default)]
    pub labels: Labels,
    /// Human readable name.
    pub display_name: String,
    /// Long description.
    #[serde(default)]
    pub description: String,
    /// Short marketing line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
    /// Logo URL or data URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    /// Authentication method.
    #[serde(default)]
    pub auth: Auth,
    /// Health probes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<ProbeDefinition>,
}

impl ConnectorDefinition {
    /// Minimal definition with the given display name and labels.
    pub fn new(display_name: impl Into<String>, labels: Labels) -> Self {
        Self {
            id: None,
            version: None,
            state: None,
            namespace: None,
            labels,
            display_name: display_name.into(),
            description: String::new(),
            highlight: None,
            logo: None,
            auth: Auth::NoAuth,
            probes: Vec::new(),
        }
    }

    /// Namespace the definition belongs to.
    pub fn namespace_or_root(&self) -> &str {
        self.namespace.as_deref().unwrap_or(ROOT_NAMESPACE)
    }

    /// Structural validation independent of the store.
    pub fn validate(&self) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(CoreError::validation(
                "display_name",
                "display name is required",
            ));
        }
        if self.version == Some(0) {
            return Err(CoreError::validation("version", "version must be >= 1"));
        }
        if let Some(ns) = &self.namespace {
            validate_path(ns)?;
        }
        validate_labels(&self.labels)?;
        self.auth.validate()?;

        let mut seen = HashSet::new();
        for probe in &self.probes {
            probe.validate()?;
            if !seen.insert(probe.id.as_str()) {
                return Err(CoreError::validation(
                    "probes",
                    format!("duplicate probe id '{}'", probe.id),
                ));
            }
        }
        Ok(())
    }

    /// Labels of this definition restricted to `keys`.
    pub fn identifying_labels(&self, keys: &[String]) -> Labels {
        subset(&self.labels, keys)
    }

    /// Canonical JSON of the full definition.
    ///
    /// Struct fields serialize in declaration order and labels are a
    /// `BTreeMap`, so equal definitions always produce equal bytes.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short content hash over the definition with its identity cleared.
    pub fn content_hash(&self) -> Result<String> {
        let mut normalized = self.clone();
        normalized.id = None;
        normalized.version = None;
        normalized.state = None;
        normalized.namespace = Some(self.namespace_or_root().to_string());

        let digest = Sha1::digest(normalized.canonical_json()?.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(HASH_LENGTH);
        Ok(hash)
    }

    /// Look up a probe by id.
    pub fn probe(&self, probe_id: &str) -> Option<&ProbeDefinition> {
        self.probes.iter().find(|p| p.id == probe_id)
    }
}

/// Aggregate read view over every version sharing an id.
#[derive(Debug, Clone)]
pub struct Connector {
    /// Representative version: the primary if one exists, else the latest.
    pub version: Arc<ConnectorVersion>,
    /// Number of stored versions for the id.
    pub total_versions: u64,
    /// Distinct states present across versions.
    pub states: BTreeSet<ConnectorVersionState>,
}

impl Connector {
    /// Connector id.
    pub fn id(&self) -> Uuid {
        self.version.id()
    }

    /// Whether any version is in the given state.
    pub fn has_state(&self, state: ConnectorVersionState) -> bool {
        self.states.contains(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake() -> ConnectorDefinition {
        let mut labels = Labels::new();
        labels.insert("type".to_string(), "fake".to_string());
        ConnectorDefinition::new("Fake Connector", labels)
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ConnectorVersionState::Draft,
            ConnectorVersionState::Primary,
            ConnectorVersionState::Active,
        ] {
            assert_eq!(state.as_str().parse::<ConnectorVersionState>().unwrap(), state);
        }
        assert!("retired".parse::<ConnectorVersionState>().is_err());
        assert!(!ConnectorVersionState::Draft.is_published());
        assert!(ConnectorVersionState::Active.is_published());
        assert_eq!(ConnectorVersionState::default(), ConnectorVersionState::Primary);
    }

    #[test]
    fn test_hash_is_short_hex() {
        let hash = fake().content_hash().unwrap();
        assert_eq!(hash.len(), HASH_LENGTH);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_ignores_identity() {
        let a = fake();
        let mut b = fake();
        b.id = Some(Uuid::new_v4());
        b.version = Some(4);
        b.state = Some(ConnectorVersionState::Active);
        b.namespace = Some("root".to_string());
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = fake();
        let mut b = fake();
        b.display_name = "Fake Connector v2".to_string();
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());

        let mut c = fake();
        c.namespace = Some("root.acme".to_string());
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn test_validate() {
        assert!(fake().validate().is_ok());

        let mut def = fake();
        def.display_name = " ".to_string();
        assert!(def.validate().is_err());

        let mut def = fake();
        def.version = Some(0);
        assert!(def.validate().is_err());

        let mut def = fake();
        def.namespace = Some("acme".to_string());
        assert!(matches!(
            def.validate(),
            Err(CoreError::InvalidNamespacePath { .. })
        ));
    }

    #[test]
    fn test_deserialize_minimal_config_entry() {
        let def: ConnectorDefinition = serde_json::from_str(
            r#"{"display_name": "Fake", "labels": {"type": "fake"}}"#,
        )
        .unwrap();
        assert_eq!(def.auth, Auth::NoAuth);
        assert!(def.id.is_none());
        assert_eq!(def.namespace_or_root(), "root");
        assert_eq!(
            def.identifying_labels(&["type".to_string()]).get("type"),
            Some(&"fake".to_string())
        );
    }
}
