// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OAuth2 collaborator seam.
//!
//! The authorization-code flow and token storage live outside this crate.
//! The lifecycle core only needs two things from them: revoking a
//! connection's tokens during disconnect, and an access token when a probe
//! is sent through the connection proxy.

use async_trait::async_trait;

use crate::connection::ConnectionEntity;
use crate::error::Result;

/// OAuth2 operations for one connection.
#[async_trait]
pub trait OAuth2Connection: Send + Sync {
    /// Whether tokens held for this connection can be revoked.
    fn supports_revoke_tokens(&self) -> bool;

    /// Revoke the connection's tokens at the provider.
    async fn revoke_tokens(&self) -> Result<()>;

    /// Current access token, if the connection holds one.
    async fn access_token(&self) -> Result<Option<String>>;
}

/// Creates [`OAuth2Connection`] handlers.
#[async_trait]
pub trait OAuth2Factory: Send + Sync {
    /// Handler for an OAuth2 connection.
    async fn new_oauth2(&self, connection: &ConnectionEntity) -> Result<Box<dyn OAuth2Connection>>;
}

/// Factory for deployments without an OAuth2 token store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOAuth2Factory;

struct NoopOAuth2Connection;

#[async_trait]
impl OAuth2Connection for NoopOAuth2Connection {
    fn supports_revoke_tokens(&self) -> bool {
        false
    }

    async fn revoke_tokens(&self) -> Result<()> {
        Ok(())
    }

    async fn access_token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
impl OAuth2Factory for NoopOAuth2Factory {
    async fn new_oauth2(&self, _connection: &ConnectionEntity) -> Result<Box<dyn OAuth2Connection>> {
        Ok(Box::new(NoopOAuth2Connection))
    }
}
