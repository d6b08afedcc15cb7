// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector authentication methods.
//!
//! [`Auth`] is a closed union resolved once at deserialization through its
//! `type` tag. Capabilities such as token revocation are answered by the
//! variant itself.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::encrypt::EncryptService;
use crate::error::{CoreError, Result};

/// How a connector authenticates to the third party.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    /// OAuth2 authorization code flow.
    #[serde(rename = "oauth2")]
    OAuth2(AuthOAuth2),
    /// Static API key.
    ApiKey(AuthApiKey),
    /// No authentication.
    #[default]
    NoAuth,
}

/// Discriminant of [`Auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// OAuth2.
    OAuth2,
    /// API key.
    ApiKey,
    /// No authentication.
    NoAuth,
}

impl Auth {
    /// The discriminant of this auth method.
    pub fn auth_type(&self) -> AuthType {
        match self {
            Self::OAuth2(_) => AuthType::OAuth2,
            Self::ApiKey(_) => AuthType::ApiKey,
            Self::NoAuth => AuthType::NoAuth,
        }
    }

    /// Whether connections using this method can have their credentials revoked.
    pub fn supports_revoke_tokens(&self) -> bool {
        match self {
            Self::OAuth2(o) => o.revocation.is_some(),
            Self::ApiKey(_) | Self::NoAuth => false,
        }
    }

    /// Structural validation of the auth configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::OAuth2(o) => {
                require_url("auth.authorization.endpoint", &o.authorization.endpoint)?;
                require_url("auth.token.endpoint", &o.token.endpoint)?;
                if let Some(revocation) = &o.revocation {
                    require_url("auth.revocation.endpoint", &revocation.endpoint)?;
                }
                for scope in &o.scopes {
                    if scope.id.trim().is_empty() {
                        return Err(CoreError::validation("auth.scopes", "scope id is empty"));
                    }
                }
                Ok(())
            }
            Self::ApiKey(k) => match &k.placement {
                ApiKeyPlacement::Header { name, .. } if name.trim().is_empty() => Err(
                    CoreError::validation("auth.placement.name", "header name is empty"),
                ),
                ApiKeyPlacement::Query { param } if param.trim().is_empty() => Err(
                    CoreError::validation("auth.placement.param", "query parameter is empty"),
                ),
                _ => Ok(()),
            },
            Self::NoAuth => Ok(()),
        }
    }
}

fn require_url(field: &str, value: &str) -> Result<()> {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(())
    } else {
        Err(CoreError::validation(
            field,
            format!("'{}' is not an http(s) URL", value),
        ))
    }
}

/// OAuth2 configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOAuth2 {
    /// OAuth2 client id.
    pub client_id: KeySource,
    /// OAuth2 client secret.
    pub client_secret: KeySource,
    /// Requested scopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<Scope>,
    /// Authorization endpoint configuration.
    pub authorization: OAuth2Endpoint,
    /// Token endpoint configuration.
    pub token: OAuth2Endpoint,
    /// Token revocation endpoint (RFC 7009), if the provider supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation: Option<OAuth2Endpoint>,
}

/// An OAuth2 endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Endpoint {
    /// Endpoint URL.
    pub endpoint: String,
}

/// An OAuth2 scope requested by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Provider scope identifier.
    pub id: String,
    /// Whether the scope must be granted.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Why the scope is needed, shown to end users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_true() -> bool {
    true
}

/// API key configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthApiKey {
    /// Where the key value comes from.
    pub key: KeySource,
    /// Where the key is attached on outbound requests.
    pub placement: ApiKeyPlacement,
}

/// Placement of an API key on a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "in", rename_all = "snake_case")]
pub enum ApiKeyPlacement {
    /// Request header, optionally prefixed (e.g. `Bearer `).
    Header {
        /// Header name.
        name: String,
        /// Value prefix.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    /// Query string parameter.
    Query {
        /// Parameter name.
        param: String,
    },
}

/// Source of a secret value in a connector definition.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySource {
    /// Inline value.
    Value {
        /// The value.
        value: String,
    },
    /// Read from an environment variable when resolved.
    EnvVar {
        /// Variable name.
        env_var: String,
    },
    /// Ciphertext produced by the namespace-scoped encryption of the
    /// connector's namespace.
    Encrypted {
        /// base64 ciphertext.
        encrypted: String,
    },
}

impl KeySource {
    /// Resolve the secret value.
    pub async fn resolve(&self, encrypt: &dyn EncryptService, namespace: &str) -> Result<String> {
        match self {
            Self::Value { value } => Ok(value.clone()),
            Self::EnvVar { env_var } => std::env::var(env_var).map_err(|_| {
                CoreError::validation(
                    "key_source.env_var",
                    format!("environment variable '{}' is not set", env_var),
                )
            }),
            Self::Encrypted { encrypted } => {
                encrypt
                    .decrypt_string_for_namespace(namespace, encrypted)
                    .await
            }
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value { .. } => f.write_str("KeySource::Value(<redacted>)"),
            Self::EnvVar { env_var } => write!(f, "KeySource::EnvVar({})", env_var),
            Self::Encrypted { .. } => f.write_str("KeySource::Encrypted(<ciphertext>)"),
        }
    }
}
