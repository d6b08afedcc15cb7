// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for authproxy-worker.
//!
//! [`WorkerRuntime`] runs the task worker and the probe scheduler inside an
//! existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use authproxy_core::tasks::MemoryTaskQueue;
//! use authproxy_worker::runtime::WorkerRuntime;
//!
//! let queue = Arc::new(MemoryTaskQueue::new());
//! let service = CoreService::builder()
//!     .store(store)
//!     .encrypt(encrypt)
//!     .queue(queue.clone())
//!     .build()?;
//!
//! let runtime = WorkerRuntime::builder()
//!     .service(service)
//!     .source(queue)
//!     .concurrency(8)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... run your application ...
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use authproxy_core::tasks::{DEFAULT_QUEUE, TaskMux, TaskSource};
use authproxy_core::CoreService;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::probe_scheduler::{ProbeScheduler, ProbeSchedulerConfig};
use crate::task_worker::{TaskWorker, TaskWorkerConfig};

/// Builder for creating a [`WorkerRuntime`].
pub struct WorkerRuntimeBuilder {
    service: Option<CoreService>,
    source: Option<Arc<dyn TaskSource>>,
    queue: String,
    concurrency: usize,
    poll_timeout: Duration,
    base_backoff: Duration,
    max_backoff: Duration,
    probe_refresh_interval: Duration,
    probe_tick_interval: Duration,
    probes_enabled: bool,
}

impl Default for WorkerRuntimeBuilder {
    fn default() -> Self {
        let worker = TaskWorkerConfig::default();
        let probes = ProbeSchedulerConfig::default();
        Self {
            service: None,
            source: None,
            queue: DEFAULT_QUEUE.to_string(),
            concurrency: worker.concurrency,
            poll_timeout: worker.poll_timeout,
            base_backoff: worker.base_backoff,
            max_backoff: worker.max_backoff,
            probe_refresh_interval: probes.refresh_interval,
            probe_tick_interval: probes.tick_interval,
            probes_enabled: true,
        }
    }
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lifecycle service (required).
    ///
    /// Probe tasks are enqueued on the service's queue.
    pub fn service(mut self, service: CoreService) -> Self {
        self.service = Some(service);
        self
    }

    /// Set where tasks are consumed from (required).
    pub fn source(mut self, source: Arc<dyn TaskSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the queue to consume and enqueue probes on.
    ///
    /// Default: `default`
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the number of tasks processed at once.
    ///
    /// Default: 4
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set how long one dequeue call waits.
    ///
    /// Default: 1 second
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the retry backoff bounds.
    ///
    /// Default: 1 second doubling up to 10 minutes
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Set how often periodic probes are reloaded.
    ///
    /// Default: 60 seconds
    pub fn probe_refresh_interval(mut self, interval: Duration) -> Self {
        self.probe_refresh_interval = interval;
        self
    }

    /// Set how often due probes are checked.
    ///
    /// Default: 1 second
    pub fn probe_tick_interval(mut self, interval: Duration) -> Self {
        self.probe_tick_interval = interval;
        self
    }

    /// Enable or disable the probe scheduler.
    ///
    /// Default: enabled
    pub fn probes_enabled(mut self, enabled: bool) -> Self {
        self.probes_enabled = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let service = self
            .service
            .ok_or_else(|| anyhow::anyhow!("service is required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("source is required"))?;
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be positive");
        }

        Ok(WorkerRuntimeConfig {
            service,
            source,
            worker: TaskWorkerConfig {
                queue: self.queue.clone(),
                concurrency: self.concurrency,
                poll_timeout: self.poll_timeout,
                base_backoff: self.base_backoff,
                max_backoff: self.max_backoff,
            },
            probes: self.probes_enabled.then(|| ProbeSchedulerConfig {
                refresh_interval: self.probe_refresh_interval,
                tick_interval: self.probe_tick_interval,
                queue: self.queue,
            }),
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    service: CoreService,
    source: Arc<dyn TaskSource>,
    worker: TaskWorkerConfig,
    probes: Option<ProbeSchedulerConfig>,
}

impl WorkerRuntimeConfig {
    /// Start the runtime, spawning the task worker and probe scheduler.
    pub async fn start(self) -> Result<WorkerRuntime> {
        let mut mux = TaskMux::new();
        self.service.register_tasks(&mut mux);
        let task_types = mux.task_types();

        let worker = TaskWorker::new(self.source.clone(), Arc::new(mux), self.worker.clone());
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        let probes = self.probes.map(|config| {
            let scheduler = ProbeScheduler::new(self.service.clone(), config);
            let shutdown = scheduler.shutdown_handle();
            let handle = tokio::spawn(async move {
                scheduler.run().await;
            });
            (handle, shutdown)
        });

        info!(
            queue = %self.worker.queue,
            concurrency = self.worker.concurrency,
            task_types = ?task_types,
            probes = probes.is_some(),
            "WorkerRuntime started"
        );

        Ok(WorkerRuntime {
            worker_handle,
            worker_shutdown,
            probes,
            service: self.service,
        })
    }
}

/// A running authproxy worker.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkerRuntime {
    worker_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    probes: Option<(JoinHandle<()>, Arc<Notify>)>,
    service: CoreService,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// The lifecycle service the runtime works for.
    pub fn service(&self) -> &CoreService {
        &self.service
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the probe scheduler, then waits for in-flight tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");

        if let Some((handle, shutdown)) = self.probes {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Probe scheduler task panicked: {}", e);
            }
        }

        self.worker_shutdown.notify_one();
        match self.worker_handle.await {
            Ok(()) => {
                info!("WorkerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Task worker task panicked: {}", e);
                Err(anyhow::anyhow!("task worker panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let probes_running = self
            .probes
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished());
        !self.worker_handle.is_finished() && probes_running
    }
}
