// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for authproxy-core integration tests.
//!
//! Provides TestContext with a file-backed SQLite store in a temp directory.

#![allow(dead_code)]

use std::sync::Arc;

use authproxy_core::connector::ConnectorDefinition;
use authproxy_core::oauth2::OAuth2Factory;
use authproxy_core::tasks::MemoryTaskQueue;
use authproxy_core::{AesGcmEncryptService, CoreService, Labels, SqlitePersistence};

/// Test context owning the store, queue and temp directory.
pub struct TestContext {
    pub service: CoreService,
    pub store: Arc<SqlitePersistence>,
    pub queue: Arc<MemoryTaskQueue>,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context without configured connectors.
    pub async fn new() -> Self {
        Self::with(Vec::new(), None).await
    }

    /// Context with configured connectors and an optional OAuth2 factory.
    pub async fn with(
        connectors: Vec<ConnectorDefinition>,
        oauth2: Option<Arc<dyn OAuth2Factory>>,
    ) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let store = Arc::new(
            SqlitePersistence::from_path(temp_dir.path().join("authproxy.db"))
                .await
                .expect("sqlite store"),
        );
        let queue = Arc::new(MemoryTaskQueue::new());

        let mut builder = CoreService::builder()
            .store(store.clone())
            .encrypt(Arc::new(AesGcmEncryptService::new([7u8; 32])))
            .queue(queue.clone())
            .connectors(connectors);
        if let Some(oauth2) = oauth2 {
            builder = builder.oauth2(oauth2);
        }

        Self {
            service: builder.build().expect("core service"),
            store,
            queue,
            _temp_dir: temp_dir,
        }
    }

    /// Rebuild the service over the same store with different connectors.
    pub fn reconfigure(&self, connectors: Vec<ConnectorDefinition>) -> CoreService {
        CoreService::builder()
            .store(self.store.clone())
            .encrypt(self.service.encrypt_service().clone())
            .queue(self.queue.clone())
            .oauth2(self.service.oauth2().clone())
            .connectors(connectors)
            .build()
            .expect("core service")
    }

    /// Number of connector version rows.
    pub async fn connector_version_rows(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM connector_versions")
            .fetch_one(self.store.pool())
            .await
            .expect("count connector versions")
    }

    /// Number of namespace rows.
    pub async fn namespace_rows(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM namespaces")
            .fetch_one(self.store.pool())
            .await
            .expect("count namespaces")
    }
}

/// Definition labelled `type=<kind>`.
pub fn definition(kind: &str, display_name: &str) -> ConnectorDefinition {
    let mut labels = Labels::new();
    labels.insert("type".to_string(), kind.to_string());
    ConnectorDefinition::new(display_name, labels)
}
