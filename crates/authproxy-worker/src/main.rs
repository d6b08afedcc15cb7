// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authproxy Worker - Connection Lifecycle Background Processing
//!
//! A long-running process responsible for:
//! - Reconciling configured connector definitions at startup
//! - Disconnecting connections (token revocation, deletion)
//! - Scheduling and invoking connection probes

use std::sync::Arc;
use tracing::{info, warn};

use authproxy_core::tasks::{MemoryTaskQueue, TaskQueue, TaskSource};
use authproxy_core::{AesGcmEncryptService, CoreService, MigrationAction, SqlitePersistence};
use authproxy_worker::config::Config;
use authproxy_worker::redis_queue::RedisTaskQueue;
use authproxy_worker::runtime::WorkerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authproxy_worker=info,authproxy_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database_url = %config.core.database_url,
        queue = %config.queue,
        concurrency = config.concurrency,
        redis = config.redis_url.is_some(),
        "Starting Authproxy Worker"
    );

    // Migrations run on connect
    let store = if config.core.database_url.starts_with("sqlite:") {
        SqlitePersistence::connect(&config.core.database_url).await?
    } else {
        SqlitePersistence::from_path(&config.core.database_url).await?
    };
    info!("Database schema verified");

    let encrypt = AesGcmEncryptService::from_base64(&config.core.encryption_key)?;

    let (queue, source): (Arc<dyn TaskQueue>, Arc<dyn TaskSource>) = match &config.redis_url {
        Some(url) => {
            let redis = Arc::new(RedisTaskQueue::connect(url).await?);
            info!("Connected to Redis task queue");
            (redis.clone() as Arc<dyn TaskQueue>, redis as Arc<dyn TaskSource>)
        }
        None => {
            warn!("AUTHPROXY_REDIS_URL not set; tasks are kept in process");
            let memory = Arc::new(MemoryTaskQueue::new());
            (
                memory.clone() as Arc<dyn TaskQueue>,
                memory as Arc<dyn TaskSource>,
            )
        }
    };

    let service = CoreService::builder()
        .store(Arc::new(store))
        .encrypt(Arc::new(encrypt))
        .queue(queue)
        .config(&config.core)
        .connectors(config.core.load_connectors()?)
        .build()?;

    if config.migrate_on_start {
        let report = service.migrate().await?;
        info!(
            definitions = report.results.len(),
            created = report.count(MigrationAction::Created),
            updated = report.count(MigrationAction::Updated),
            state_changed = report.count(MigrationAction::StateChanged),
            "Connector definitions reconciled"
        );
    }

    let runtime = WorkerRuntime::builder()
        .service(service)
        .source(source)
        .queue(&config.queue)
        .concurrency(config.concurrency)
        .probe_refresh_interval(config.probe_refresh_interval)
        .build()?
        .start()
        .await?;

    info!("Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Authproxy Worker shut down");

    Ok(())
}
