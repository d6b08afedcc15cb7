// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the worker runtime over a file-backed store and the
//! in-process task queue.

use std::sync::Arc;
use std::time::Duration;

use authproxy_core::connector::ConnectorDefinition;
use authproxy_core::probe::{HttpProbeRequest, ProbeDefinition};
use authproxy_core::tasks::{
    EnqueueOptions, MemoryTaskQueue, TASK_TYPE_MIGRATE_CONNECTORS, Task, TaskQueue, TaskState,
};
use authproxy_core::{AesGcmEncryptService, CoreService, Labels, ProbeOutcome, SqlitePersistence};
use authproxy_worker::runtime::WorkerRuntime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    service: CoreService,
    queue: Arc<MemoryTaskQueue>,
    _temp_dir: tempfile::TempDir,
}

async fn harness(connectors: Vec<ConnectorDefinition>) -> Harness {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let store = SqlitePersistence::from_path(temp_dir.path().join("worker.db"))
        .await
        .unwrap();
    let queue = Arc::new(MemoryTaskQueue::new());
    let service = CoreService::builder()
        .store(Arc::new(store))
        .encrypt(Arc::new(AesGcmEncryptService::new([9u8; 32])))
        .queue(queue.clone())
        .connectors(connectors)
        .build()
        .unwrap();
    Harness {
        service,
        queue,
        _temp_dir: temp_dir,
    }
}

async fn start(h: &Harness) -> WorkerRuntime {
    WorkerRuntime::builder()
        .service(h.service.clone())
        .source(h.queue.clone())
        .poll_timeout(Duration::from_millis(20))
        .backoff(Duration::from_millis(10), Duration::from_millis(100))
        .probe_refresh_interval(Duration::from_millis(100))
        .probe_tick_interval(Duration::from_millis(20))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

fn connector(kind: &str) -> ConnectorDefinition {
    let mut labels = Labels::new();
    labels.insert("type".to_string(), kind.to_string());
    ConnectorDefinition::new(kind, labels)
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_disconnect_is_processed_by_worker() {
    let h = harness(Vec::new()).await;
    let cv = h
        .service
        .create_connector_version(connector("plain"))
        .await
        .unwrap();
    let conn = h
        .service
        .create_connection("root.acme", cv, Labels::new())
        .await
        .unwrap();

    let runtime = start(&h).await;
    let info = h.service.disconnect_connection(conn.id()).await.unwrap();

    let service = h.service.clone();
    let id = conn.id();
    let deleted = eventually(|| {
        let service = service.clone();
        async move {
            matches!(service.get_connection(id).await, Err(e) if e.is_not_found())
        }
    })
    .await;
    assert!(deleted, "connection was not deleted");

    let settled = h.queue.get_task_info("default", &info.id).await.unwrap();
    assert_eq!(settled.state, TaskState::Completed);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_periodic_probe_is_scheduled_and_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(Vec::new()).await;
    let mut def = connector("pinger");
    def.probes = vec![ProbeDefinition {
        id: "health".to_string(),
        period: Some("200ms".to_string()),
        cron: None,
        http: Some(HttpProbeRequest {
            method: "GET".to_string(),
            url: format!("{}/health", server.uri()),
            headers: Default::default(),
            body: None,
            via_proxy: false,
        }),
    }];
    let cv = h.service.create_connector_version(def).await.unwrap();
    let conn = h
        .service
        .create_connection("root", cv, Labels::new())
        .await
        .unwrap();

    let runtime = start(&h).await;

    let service = h.service.clone();
    let id = conn.id();
    let recorded = eventually(|| {
        let service = service.clone();
        async move {
            service
                .list_probe_outcomes(id, Some("health"), 10)
                .await
                .map(|outcomes| {
                    outcomes
                        .iter()
                        .any(|o| o.outcome == ProbeOutcome::Success)
                })
                .unwrap_or(false)
        }
    })
    .await;
    assert!(recorded, "no probe outcome was recorded");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_migrate_task_applies_configured_connectors() {
    let h = harness(vec![connector("fake"), connector("google")]).await;
    let runtime = WorkerRuntime::builder()
        .service(h.service.clone())
        .source(h.queue.clone())
        .poll_timeout(Duration::from_millis(20))
        .probes_enabled(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let info = h
        .queue
        .enqueue(
            Task::new(TASK_TYPE_MIGRATE_CONNECTORS, &serde_json::json!({})).unwrap(),
            EnqueueOptions::default().retention(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    let queue = h.queue.clone();
    let task_id = info.id.clone();
    let done = eventually(|| {
        let queue = queue.clone();
        let task_id = task_id.clone();
        async move {
            queue
                .get_task_info("default", &task_id)
                .await
                .map(|t| t.state == TaskState::Completed)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(done, "migration task did not complete");

    let again = h.service.migrate().await.unwrap();
    assert_eq!(again.writes(), 0);
    assert_eq!(again.results.len(), 2);

    runtime.shutdown().await.unwrap();
}
