// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The lifecycle service facade.
//!
//! [`CoreService`] is the surface the API layer and the workers call into. It
//! holds shared, stateless handles to the store, the encryption service, the
//! task queue and the OAuth2/HTTP collaborators; cloning it is cheap.
//!
//! Operations are grouped by concern in the modules that own the types:
//! connector operations in `connector::service`, connection operations in
//! `connection::service`, and reconciliation in `migration`.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(SqlitePersistence::from_path(".data/authproxy.db").await?);
//! let encrypt = Arc::new(AesGcmEncryptService::from_base64(&config.encryption_key)?);
//!
//! let service = CoreService::builder()
//!     .store(store)
//!     .encrypt(encrypt)
//!     .queue(Arc::new(MemoryTaskQueue::new()))
//!     .config(&config)
//!     .connectors(config.load_connectors()?)
//!     .build()?;
//!
//! service.migrate().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{Config, DEFAULT_IDENTIFYING_LABELS};
use crate::connection::ConnectionState;
use crate::connector::{ConnectorDefinition, ConnectorVersion, ConnectorVersionRecord};
use crate::encrypt::EncryptService;
use crate::error::{CoreError, Result};
use crate::httpf::{ConnectionRequestFactory, RequestFactory};
use crate::labels::Labels;
use crate::namespace::{self, Namespace, NamespaceMatcher};
use crate::oauth2::{NoopOAuth2Factory, OAuth2Factory};
use crate::persistence::Persistence;
use crate::probe::CronTask;
use crate::tasks::{
    DisconnectConnectionHandler, InvokeProbeHandler, MigrateConnectorsHandler, TaskMux,
    TaskQueue, TASK_TYPE_DISCONNECT_CONNECTION, TASK_TYPE_INVOKE_PROBE,
    TASK_TYPE_MIGRATE_CONNECTORS,
};

/// Default retention of disconnect task results.
pub const DEFAULT_DISCONNECT_RETENTION: Duration = Duration::from_secs(600);

/// Default wait for the migration lock.
pub const DEFAULT_MIGRATION_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder for [`CoreService`].
pub struct CoreServiceBuilder {
    store: Option<Arc<dyn Persistence>>,
    encrypt: Option<Arc<dyn EncryptService>>,
    queue: Option<Arc<dyn TaskQueue>>,
    oauth2: Option<Arc<dyn OAuth2Factory>>,
    request_factory: Option<Arc<dyn RequestFactory>>,
    identifying_labels: Vec<String>,
    connectors: Vec<ConnectorDefinition>,
    disconnect_retention: Duration,
    migration_lock_timeout: Duration,
    instance_id: Option<String>,
}

impl Default for CoreServiceBuilder {
    fn default() -> Self {
        Self {
            store: None,
            encrypt: None,
            queue: None,
            oauth2: None,
            request_factory: None,
            identifying_labels: vec![DEFAULT_IDENTIFYING_LABELS.to_string()],
            connectors: Vec::new(),
            disconnect_retention: DEFAULT_DISCONNECT_RETENTION,
            migration_lock_timeout: DEFAULT_MIGRATION_LOCK_TIMEOUT,
            instance_id: None,
        }
    }
}

impl CoreServiceBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store adapter (required).
    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the encryption service (required).
    pub fn encrypt(mut self, encrypt: Arc<dyn EncryptService>) -> Self {
        self.encrypt = Some(encrypt);
        self
    }

    /// Set the task queue client (required).
    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the OAuth2 factory.
    ///
    /// Default: [`NoopOAuth2Factory`]
    pub fn oauth2(mut self, oauth2: Arc<dyn OAuth2Factory>) -> Self {
        self.oauth2 = Some(oauth2);
        self
    }

    /// Set the request factory used for probes.
    ///
    /// Default: [`ConnectionRequestFactory`] over the configured OAuth2 factory.
    pub fn request_factory(mut self, factory: Arc<dyn RequestFactory>) -> Self {
        self.request_factory = Some(factory);
        self
    }

    /// Set the label keys used to correlate definitions without an id.
    ///
    /// Default: `["type"]`
    pub fn identifying_labels(mut self, keys: Vec<String>) -> Self {
        self.identifying_labels = keys;
        self
    }

    /// Set the declared connectors reconciled by `migrate`.
    pub fn connectors(mut self, connectors: Vec<ConnectorDefinition>) -> Self {
        self.connectors = connectors;
        self
    }

    /// Set how long disconnect task results are retained.
    ///
    /// Default: 10 minutes
    pub fn disconnect_retention(mut self, retention: Duration) -> Self {
        self.disconnect_retention = retention;
        self
    }

    /// Set how long `migrate` waits for the migration lock.
    ///
    /// Default: 60 seconds
    pub fn migration_lock_timeout(mut self, timeout: Duration) -> Self {
        self.migration_lock_timeout = timeout;
        self
    }

    /// Set the lock holder id of this process.
    ///
    /// Default: a random UUID.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Apply the tunables of a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.identifying_labels(config.identifying_labels.clone())
            .disconnect_retention(config.disconnect_retention)
            .migration_lock_timeout(config.migration_lock_timeout)
    }

    /// Build the service.
    ///
    /// Returns an error if a required collaborator is missing.
    pub fn build(self) -> Result<CoreService> {
        let store = self
            .store
            .ok_or_else(|| CoreError::validation("store", "store is required"))?;
        let encrypt = self
            .encrypt
            .ok_or_else(|| CoreError::validation("encrypt", "encryption service is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| CoreError::validation("queue", "task queue is required"))?;
        if self.identifying_labels.is_empty() {
            return Err(CoreError::validation(
                "identifying_labels",
                "at least one identifying label key is required",
            ));
        }

        let oauth2 = self
            .oauth2
            .unwrap_or_else(|| Arc::new(NoopOAuth2Factory) as Arc<dyn OAuth2Factory>);
        let request_factory = match self.request_factory {
            Some(factory) => factory,
            None => Arc::new(ConnectionRequestFactory::new(oauth2.clone())?),
        };

        Ok(CoreService {
            inner: Arc::new(Inner {
                store,
                encrypt,
                queue,
                oauth2,
                request_factory,
                identifying_labels: self.identifying_labels,
                connectors: self.connectors,
                disconnect_retention: self.disconnect_retention,
                migration_lock_timeout: self.migration_lock_timeout,
                instance_id: self
                    .instance_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            }),
        })
    }
}

struct Inner {
    store: Arc<dyn Persistence>,
    encrypt: Arc<dyn EncryptService>,
    queue: Arc<dyn TaskQueue>,
    oauth2: Arc<dyn OAuth2Factory>,
    request_factory: Arc<dyn RequestFactory>,
    identifying_labels: Vec<String>,
    connectors: Vec<ConnectorDefinition>,
    disconnect_retention: Duration,
    migration_lock_timeout: Duration,
    instance_id: String,
}

/// Connector and connection lifecycle operations.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<Inner>,
}

impl CoreService {
    /// Create a new builder for configuring the service.
    pub fn builder() -> CoreServiceBuilder {
        CoreServiceBuilder::new()
    }

    /// The store adapter.
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.inner.store
    }

    /// The encryption service.
    pub fn encrypt_service(&self) -> &Arc<dyn EncryptService> {
        &self.inner.encrypt
    }

    /// The task queue client.
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.inner.queue
    }

    /// The OAuth2 factory.
    pub fn oauth2(&self) -> &Arc<dyn OAuth2Factory> {
        &self.inner.oauth2
    }

    /// The probe request factory.
    pub fn request_factory(&self) -> &Arc<dyn RequestFactory> {
        &self.inner.request_factory
    }

    /// Identifying label keys.
    pub fn identifying_labels(&self) -> &[String] {
        &self.inner.identifying_labels
    }

    /// Declared connectors reconciled by `migrate`.
    pub fn configured_connectors(&self) -> &[ConnectorDefinition] {
        &self.inner.connectors
    }

    /// Retention of disconnect task results.
    pub fn disconnect_retention(&self) -> Duration {
        self.inner.disconnect_retention
    }

    /// Wait budget for the migration lock.
    pub fn migration_lock_timeout(&self) -> Duration {
        self.inner.migration_lock_timeout
    }

    /// Lock holder id of this service instance.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub(crate) fn wrap_version(&self, record: ConnectorVersionRecord) -> ConnectorVersion {
        ConnectorVersion::from_record(record, self.inner.encrypt.clone())
    }

    // ========================================================================
    // Namespaces
    // ========================================================================

    /// Make sure `path` and all its ancestors exist. Returns the leaf.
    pub async fn ensure_namespace_ancestor_path(
        &self,
        path: &str,
        labels: &Labels,
    ) -> Result<Namespace> {
        namespace::ensure_ancestor_path(self.inner.store.as_ref(), path, labels).await
    }

    /// Fetch one namespace.
    pub async fn get_namespace(&self, path: &str) -> Result<Namespace> {
        namespace::validate_path(path)?;
        self.inner
            .store
            .get_namespace(path)
            .await?
            .ok_or_else(|| CoreError::not_found("namespace", path))
    }

    /// List namespaces selected by `matcher`, or all of them.
    pub async fn list_namespaces(
        &self,
        matcher: Option<&NamespaceMatcher>,
    ) -> Result<Vec<Namespace>> {
        self.inner.store.list_namespaces(matcher).await
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Register the core task handlers on `mux`.
    pub fn register_tasks(&self, mux: &mut TaskMux) {
        mux.register(
            TASK_TYPE_DISCONNECT_CONNECTION,
            Arc::new(DisconnectConnectionHandler::new(self.clone())),
        );
        mux.register(
            TASK_TYPE_INVOKE_PROBE,
            Arc::new(InvokeProbeHandler::new(self.clone())),
        );
        mux.register(
            TASK_TYPE_MIGRATE_CONNECTORS,
            Arc::new(MigrateConnectorsHandler::new(self.clone())),
        );
    }

    /// Periodic probe entries for every live connection.
    ///
    /// A connection whose connector definition cannot be read is skipped
    /// with a warning so one bad record does not stop scheduling for the
    /// rest.
    pub async fn get_cron_tasks(&self) -> Result<Vec<CronTask>> {
        let mut live = Vec::new();
        self.list_connections_builder()
            .with_states([ConnectionState::Created, ConnectionState::Ready])
            .enumerate(|conn| {
                live.push(conn);
                std::ops::ControlFlow::Continue(())
            })
            .await?;

        let mut tasks = Vec::new();
        for conn in live {
            let probes = match conn.probes().await {
                Ok(probes) => probes,
                Err(e) => {
                    warn!(
                        connection_id = %conn.id(),
                        error = %e,
                        "Skipping probes of connection"
                    );
                    continue;
                }
            };

            for probe in probes {
                if let Some(schedule) = probe.schedule.schedule_string() {
                    tasks.push(CronTask {
                        connection_id: conn.id(),
                        probe_id: probe.id,
                        schedule,
                    });
                }
            }
        }

        debug!(count = tasks.len(), "Collected probe cron tasks");
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::AesGcmEncryptService;
    use crate::persistence::SqlitePersistence;
    use crate::tasks::MemoryTaskQueue;

    async fn service() -> CoreService {
        CoreService::builder()
            .store(Arc::new(SqlitePersistence::in_memory().await.unwrap()))
            .encrypt(Arc::new(AesGcmEncryptService::new([7u8; 32])))
            .queue(Arc::new(MemoryTaskQueue::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let err = CoreService::builder().build().err().unwrap();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = CoreService::builder()
            .store(Arc::new(SqlitePersistence::in_memory().await.unwrap()))
            .encrypt(Arc::new(AesGcmEncryptService::new([7u8; 32])))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("queue"));
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let svc = service().await;
        assert_eq!(svc.identifying_labels(), &["type".to_string()]);
        assert_eq!(svc.disconnect_retention(), DEFAULT_DISCONNECT_RETENTION);
        assert!(!svc.instance_id().is_empty());
        assert!(svc.configured_connectors().is_empty());
    }

    #[tokio::test]
    async fn test_register_tasks() {
        let svc = service().await;
        let mut mux = TaskMux::new();
        svc.register_tasks(&mut mux);
        assert_eq!(
            mux.task_types(),
            vec![
                TASK_TYPE_DISCONNECT_CONNECTION.to_string(),
                TASK_TYPE_MIGRATE_CONNECTORS.to_string(),
                TASK_TYPE_INVOKE_PROBE.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_namespace_ancestor_path_is_idempotent() {
        let svc = service().await;
        svc.ensure_namespace_ancestor_path("root.a.b", &Labels::new())
            .await
            .unwrap();
        let leaf = svc
            .ensure_namespace_ancestor_path("root.a.b", &Labels::new())
            .await
            .unwrap();
        assert_eq!(leaf.path, "root.a.b");
        assert_eq!(svc.list_namespaces(None).await.unwrap().len(), 3);

        assert!(svc.get_namespace("root.a").await.is_ok());
        assert!(svc.get_namespace("root.z").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cron_tasks_empty_without_connections() {
        let svc = service().await;
        assert!(svc.get_cron_tasks().await.unwrap().is_empty());
    }
}
