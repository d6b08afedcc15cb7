// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Asynchronous connection teardown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{Task, TaskError, TaskHandler};
use crate::connection::ConnectionState;
use crate::service::CoreService;

/// Payload of a `connection:disconnect` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectConnectionPayload {
    /// Connection to tear down.
    pub connection_id: Uuid,
}

/// Revokes credentials, marks the connection disconnected and deletes it.
///
/// Every step is safe to repeat, so a redelivered task resumes where the
/// previous attempt failed. A connection that no longer exists is treated as
/// already torn down.
pub struct DisconnectConnectionHandler {
    service: CoreService,
}

impl DisconnectConnectionHandler {
    /// Create a handler backed by `service`.
    pub fn new(service: CoreService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for DisconnectConnectionHandler {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        let payload: DisconnectConnectionPayload = task.decode()?;
        let id = payload.connection_id;

        let mut conn = match self.service.get_connection(id).await {
            Ok(conn) => conn,
            Err(e) if e.is_not_found() => {
                return Err(TaskError::SkipRetry(format!(
                    "connection '{}' not found",
                    id
                )));
            }
            Err(e) => return Err(TaskError::retry(e)),
        };

        let definition = conn
            .connector_version()
            .definition()
            .await
            .map_err(TaskError::retry)?;

        if definition.auth.supports_revoke_tokens() {
            let oauth2 = self
                .service
                .oauth2()
                .new_oauth2(&conn)
                .await
                .map_err(TaskError::retry)?;
            if oauth2.supports_revoke_tokens() {
                oauth2.revoke_tokens().await.map_err(|e| {
                    warn!(connection_id = %id, error = %e, "Failed to revoke connection tokens");
                    TaskError::retry(e)
                })?;
                info!(connection_id = %id, "Revoked connection tokens");
            }
        }

        match conn
            .set_state(self.service.store().as_ref(), ConnectionState::Disconnected)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(TaskError::retry(e)),
        }

        self.service
            .store()
            .delete_connection(id)
            .await
            .map_err(TaskError::retry)?;

        info!(connection_id = %id, "Connection disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::connection::{ConnectionEntity, ConnectionRecord};
    use crate::connector::{
        Auth, AuthOAuth2, ConnectorDefinition, ConnectorVersionRecord, ConnectorVersionState,
        KeySource, OAuth2Endpoint,
    };
    use crate::error::{CoreError, Result};
    use crate::labels::{LabelSelector, Labels};
    use crate::namespace::{Namespace, NamespaceMatcher};
    use crate::persistence::{
        ConnectionFilter, ConnectionKey, ConnectorFilter, ConnectorSummaryRecord, Persistence,
    };
    use crate::probe::ProbeOutcomeRecord;
    use crate::oauth2::{OAuth2Connection, OAuth2Factory};
    use crate::tasks::TASK_TYPE_DISCONNECT_CONNECTION;
    use crate::testing::{definition, service};

    #[derive(Default)]
    struct FakeOAuth2 {
        revoked: AtomicUsize,
        fail: AtomicBool,
    }

    struct FakeConnection(Arc<FakeOAuth2>);

    #[async_trait]
    impl OAuth2Connection for FakeConnection {
        fn supports_revoke_tokens(&self) -> bool {
            true
        }

        async fn revoke_tokens(&self) -> Result<()> {
            if self.0.fail.load(Ordering::SeqCst) {
                return Err(CoreError::Http("revocation endpoint unavailable".to_string()));
            }
            self.0.revoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn access_token(&self) -> Result<Option<String>> {
            Ok(Some("token".to_string()))
        }
    }

    struct FakeFactory(Arc<FakeOAuth2>);

    #[async_trait]
    impl OAuth2Factory for FakeFactory {
        async fn new_oauth2(
            &self,
            _connection: &ConnectionEntity,
        ) -> Result<Box<dyn OAuth2Connection>> {
            Ok(Box::new(FakeConnection(self.0.clone())))
        }
    }

    fn oauth2_definition() -> ConnectorDefinition {
        let mut def = definition("oauthy", "OAuthy");
        def.auth = Auth::OAuth2(AuthOAuth2 {
            client_id: KeySource::Value {
                value: "cid".to_string(),
            },
            client_secret: KeySource::Value {
                value: "secret".to_string(),
            },
            scopes: vec![],
            authorization: OAuth2Endpoint {
                endpoint: "https://auth.example.com/authorize".to_string(),
            },
            token: OAuth2Endpoint {
                endpoint: "https://auth.example.com/token".to_string(),
            },
            revocation: Some(OAuth2Endpoint {
                endpoint: "https://auth.example.com/revoke".to_string(),
            }),
        });
        def
    }

    async fn oauth2_service() -> (CoreService, Arc<FakeOAuth2>) {
        let (base, _) = service().await;
        let fake = Arc::new(FakeOAuth2::default());
        let svc = CoreService::builder()
            .store(base.store().clone())
            .encrypt(base.encrypt_service().clone())
            .queue(base.queue().clone())
            .oauth2(Arc::new(FakeFactory(fake.clone())))
            .build()
            .unwrap();
        (svc, fake)
    }

    fn task(connection_id: Uuid) -> Task {
        Task::new(
            TASK_TYPE_DISCONNECT_CONNECTION,
            &DisconnectConnectionPayload { connection_id },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_revokes_and_deletes() {
        let (svc, fake) = oauth2_service().await;
        let cv = svc.create_connector_version(oauth2_definition()).await.unwrap();
        let conn = svc
            .create_connection("root", cv, Labels::new())
            .await
            .unwrap();
        svc.disconnect_connection(conn.id()).await.unwrap();

        let handler = DisconnectConnectionHandler::new(svc.clone());
        handler.handle(&task(conn.id())).await.unwrap();

        assert_eq!(fake.revoked.load(Ordering::SeqCst), 1);
        assert!(svc.get_connection(conn.id()).await.unwrap_err().is_not_found());

        let err = handler.handle(&task(conn.id())).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_revoke_failure_is_retried() {
        let (svc, fake) = oauth2_service().await;
        fake.fail.store(true, Ordering::SeqCst);
        let cv = svc.create_connector_version(oauth2_definition()).await.unwrap();
        let conn = svc
            .create_connection("root", cv, Labels::new())
            .await
            .unwrap();
        svc.disconnect_connection(conn.id()).await.unwrap();

        let handler = DisconnectConnectionHandler::new(svc.clone());
        let err = handler.handle(&task(conn.id())).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(
            svc.get_connection(conn.id()).await.unwrap().state(),
            ConnectionState::Disconnecting
        );

        fake.fail.store(false, Ordering::SeqCst);
        handler.handle(&task(conn.id())).await.unwrap();
        assert!(svc.get_connection(conn.id()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_no_auth_skips_revocation() {
        let (svc, fake) = oauth2_service().await;
        let cv = svc
            .create_connector_version(definition("plain", "Plain"))
            .await
            .unwrap();
        let conn = svc
            .create_connection("root", cv, Labels::new())
            .await
            .unwrap();
        svc.disconnect_connection(conn.id()).await.unwrap();

        DisconnectConnectionHandler::new(svc.clone())
            .handle(&task(conn.id()))
            .await
            .unwrap();
        assert_eq!(fake.revoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_payload_is_not_retried() {
        let (svc, _) = service().await;
        let task = Task::new(
            TASK_TYPE_DISCONNECT_CONNECTION,
            &serde_json::json!({"connection_id": 7}),
        )
        .unwrap();
        let err = DisconnectConnectionHandler::new(svc)
            .handle(&task)
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
    }

    /// Store whose teardown writes fail while the matching flag is set.
    struct FlakyStore {
        inner: Arc<dyn Persistence>,
        fail_state: AtomicBool,
        fail_delete: AtomicBool,
    }

    impl FlakyStore {
        fn check(flag: &AtomicBool, operation: &str) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                return Err(CoreError::Database {
                    operation: operation.to_string(),
                    details: "database is locked".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Persistence for FlakyStore {
        async fn get_namespace(&self, path: &str) -> Result<Option<Namespace>> {
            self.inner.get_namespace(path).await
        }

        async fn create_namespace(&self, namespace: &Namespace) -> Result<bool> {
            self.inner.create_namespace(namespace).await
        }

        async fn list_namespaces(
            &self,
            matcher: Option<&NamespaceMatcher>,
        ) -> Result<Vec<Namespace>> {
            self.inner.list_namespaces(matcher).await
        }

        async fn get_connector_version(
            &self,
            id: Uuid,
            version: u64,
        ) -> Result<Option<ConnectorVersionRecord>> {
            self.inner.get_connector_version(id, version).await
        }

        async fn get_connector_version_for_state(
            &self,
            id: Uuid,
            state: ConnectorVersionState,
        ) -> Result<Option<ConnectorVersionRecord>> {
            self.inner.get_connector_version_for_state(id, state).await
        }

        async fn get_latest_connector_version(
            &self,
            id: Uuid,
        ) -> Result<Option<ConnectorVersionRecord>> {
            self.inner.get_latest_connector_version(id).await
        }

        async fn get_connector_versions(&self, id: Uuid) -> Result<Vec<ConnectorVersionRecord>> {
            self.inner.get_connector_versions(id).await
        }

        async fn upsert_connector_version(&self, record: &ConnectorVersionRecord) -> Result<()> {
            self.inner.upsert_connector_version(record).await
        }

        async fn find_connector_ids_by_labels(
            &self,
            selector: &LabelSelector,
        ) -> Result<Vec<Uuid>> {
            self.inner.find_connector_ids_by_labels(selector).await
        }

        async fn list_connectors(
            &self,
            filter: &ConnectorFilter,
            after: Option<Uuid>,
            limit: usize,
        ) -> Result<Vec<ConnectorSummaryRecord>> {
            self.inner.list_connectors(filter, after, limit).await
        }

        async fn create_connection(&self, record: &ConnectionRecord) -> Result<()> {
            self.inner.create_connection(record).await
        }

        async fn get_connection(&self, id: Uuid) -> Result<Option<ConnectionRecord>> {
            self.inner.get_connection(id).await
        }

        async fn update_connection_state(
            &self,
            id: Uuid,
            from: &[ConnectionState],
            to: ConnectionState,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            if to == ConnectionState::Disconnected {
                Self::check(&self.fail_state, "update_connection_state")?;
            }
            self.inner.update_connection_state(id, from, to, now).await
        }

        async fn delete_connection(&self, id: Uuid) -> Result<bool> {
            Self::check(&self.fail_delete, "delete_connection")?;
            self.inner.delete_connection(id).await
        }

        async fn list_connections(
            &self,
            filter: &ConnectionFilter,
            after: Option<ConnectionKey>,
            limit: usize,
        ) -> Result<Vec<ConnectionRecord>> {
            self.inner.list_connections(filter, after, limit).await
        }

        async fn record_probe_outcome(&self, outcome: &ProbeOutcomeRecord) -> Result<()> {
            self.inner.record_probe_outcome(outcome).await
        }

        async fn list_probe_outcomes(
            &self,
            connection_id: Uuid,
            probe_id: Option<&str>,
            limit: usize,
        ) -> Result<Vec<ProbeOutcomeRecord>> {
            self.inner
                .list_probe_outcomes(connection_id, probe_id, limit)
                .await
        }

        async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
            self.inner.try_acquire_lock(name, holder, ttl).await
        }

        async fn release_lock(&self, name: &str, holder: &str) -> Result<()> {
            self.inner.release_lock(name, holder).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_retried() {
        let (base, _) = service().await;
        let store = Arc::new(FlakyStore {
            inner: base.store().clone(),
            fail_state: AtomicBool::new(true),
            fail_delete: AtomicBool::new(true),
        });
        let svc = CoreService::builder()
            .store(store.clone())
            .encrypt(base.encrypt_service().clone())
            .queue(base.queue().clone())
            .build()
            .unwrap();

        let cv = svc
            .create_connector_version(definition("plain", "Plain"))
            .await
            .unwrap();
        let conn = svc
            .create_connection("root", cv, Labels::new())
            .await
            .unwrap();
        svc.disconnect_connection(conn.id()).await.unwrap();

        let handler = DisconnectConnectionHandler::new(svc.clone());
        let err = handler.handle(&task(conn.id())).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(
            svc.get_connection(conn.id()).await.unwrap().state(),
            ConnectionState::Disconnecting
        );

        store.fail_state.store(false, Ordering::SeqCst);
        let err = handler.handle(&task(conn.id())).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(
            svc.get_connection(conn.id()).await.unwrap().state(),
            ConnectionState::Disconnected
        );

        store.fail_delete.store(false, Ordering::SeqCst);
        handler.handle(&task(conn.id())).await.unwrap();
        assert!(svc.get_connection(conn.id()).await.unwrap_err().is_not_found());
    }
}
