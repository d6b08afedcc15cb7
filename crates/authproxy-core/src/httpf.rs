// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection-scoped HTTP request factory.
//!
//! Probes build their outbound requests here. A direct request is sent as
//! declared; a proxied request additionally carries the credentials the
//! connector's auth method prescribes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};

use crate::connection::ConnectionEntity;
use crate::connector::{ApiKeyPlacement, Auth};
use crate::error::{CoreError, Result};
use crate::oauth2::OAuth2Factory;
use crate::probe::HttpProbeRequest;

/// Default timeout for outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds outbound HTTP requests on behalf of a connection.
#[async_trait]
pub trait RequestFactory: Send + Sync {
    /// Build a request for `connection`. With `via_proxy` the connector's
    /// credentials are attached.
    async fn new_request(
        &self,
        connection: &ConnectionEntity,
        request: &HttpProbeRequest,
        via_proxy: bool,
    ) -> Result<RequestBuilder>;
}

/// Default [`RequestFactory`] applying connector auth with `reqwest`.
#[derive(Clone)]
pub struct ConnectionRequestFactory {
    client: Client,
    oauth2: Arc<dyn OAuth2Factory>,
}

impl ConnectionRequestFactory {
    /// Create a factory with its own client.
    pub fn new(oauth2: Arc<dyn OAuth2Factory>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, oauth2 })
    }

    /// Create a factory sharing an existing client.
    pub fn with_client(client: Client, oauth2: Arc<dyn OAuth2Factory>) -> Self {
        Self { client, oauth2 }
    }

    async fn apply_auth(
        &self,
        connection: &ConnectionEntity,
        builder: RequestBuilder,
    ) -> Result<RequestBuilder> {
        let cv = connection.connector_version();
        let definition = cv.definition().await?;

        match &definition.auth {
            Auth::NoAuth => Ok(builder),
            Auth::OAuth2(_) => {
                let oauth = self.oauth2.new_oauth2(connection).await?;
                match oauth.access_token().await? {
                    Some(token) => Ok(builder.bearer_auth(token)),
                    None => Err(CoreError::Http(format!(
                        "connection '{}' has no access token",
                        connection.id()
                    ))),
                }
            }
            Auth::ApiKey(api_key) => {
                let key = api_key
                    .key
                    .resolve(cv.encrypt_service().as_ref(), cv.namespace())
                    .await?;
                match &api_key.placement {
                    ApiKeyPlacement::Header { name, prefix } => {
                        let name = HeaderName::from_bytes(name.as_bytes())
                            .map_err(|e| CoreError::Http(format!("invalid header name: {}", e)))?;
                        let mut value = HeaderValue::from_str(&format!(
                            "{}{}",
                            prefix.as_deref().unwrap_or(""),
                            key
                        ))
                        .map_err(|e| CoreError::Http(format!("invalid header value: {}", e)))?;
                        value.set_sensitive(true);
                        Ok(builder.header(name, value))
                    }
                    ApiKeyPlacement::Query { param } => Ok(builder.query(&[(param, key)])),
                }
            }
        }
    }
}

#[async_trait]
impl RequestFactory for ConnectionRequestFactory {
    async fn new_request(
        &self,
        connection: &ConnectionEntity,
        request: &HttpProbeRequest,
        via_proxy: bool,
    ) -> Result<RequestBuilder> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| CoreError::Http(format!("invalid method '{}': {}", request.method, e)))?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| CoreError::Http(format!("invalid url '{}': {}", request.url, e)))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            if via_proxy && name.eq_ignore_ascii_case(AUTHORIZATION.as_str()) {
                // Credentials come from the connector, not the probe.
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        if via_proxy {
            builder = self.apply_auth(connection, builder).await?;
        }
        Ok(builder)
    }
}
