// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task worker.
//!
//! Pulls tasks from a [`TaskSource`] and dispatches them to a handler with
//! bounded concurrency. Failed tasks are retried with exponential backoff
//! until their retry budget is spent, then archived.

use std::sync::Arc;
use std::time::Duration;

use authproxy_core::tasks::{DEFAULT_QUEUE, TaskError, TaskHandler, TaskInfo, TaskSource};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Task worker configuration.
#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    /// Queue to consume.
    pub queue: String,
    /// Maximum tasks processed at once.
    pub concurrency: usize,
    /// How long one dequeue call waits for a task.
    pub poll_timeout: Duration,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            concurrency: 4,
            poll_timeout: Duration::from_secs(1),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl TaskWorkerConfig {
    /// Retry delay after `retried` previous retries.
    pub fn backoff(&self, retried: u32) -> Duration {
        let factor = 2u32.saturating_pow(retried.min(31));
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Task worker that runs as a background task.
pub struct TaskWorker {
    source: Arc<dyn TaskSource>,
    handler: Arc<dyn TaskHandler>,
    config: TaskWorkerConfig,
    shutdown: Arc<Notify>,
}

impl TaskWorker {
    /// Create a new task worker.
    pub fn new(
        source: Arc<dyn TaskSource>,
        handler: Arc<dyn TaskHandler>,
        config: TaskWorkerConfig,
    ) -> Self {
        Self {
            source,
            handler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown, then wait for in-flight tasks.
    pub async fn run(self) {
        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));

        info!(
            queue = %self.config.queue,
            concurrency,
            "Task worker started"
        );

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.notified() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = self.shutdown.notified() => break,
                next = self.source.dequeue(&self.config.queue, self.config.poll_timeout) => next,
            };

            let info = match next {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, queue = %self.config.queue, "Failed to dequeue task");
                    tokio::time::sleep(self.config.poll_timeout).await;
                    continue;
                }
            };

            let source = self.source.clone();
            let handler = self.handler.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                process(source.as_ref(), handler.as_ref(), &config, info).await;
                drop(permit);
            });
        }

        info!("Task worker shutting down, waiting for in-flight tasks");
        if permits.acquire_many(concurrency as u32).await.is_err() {
            warn!("Task worker semaphore closed during shutdown");
        }
        info!("Task worker stopped");
    }
}

/// Run one task and settle it with the source.
pub async fn process(
    source: &dyn TaskSource,
    handler: &dyn TaskHandler,
    config: &TaskWorkerConfig,
    info: TaskInfo,
) {
    debug!(task_id = %info.id, task_type = %info.task_type, retried = info.retried, "Processing task");

    let settled = match handler.handle(&info.task()).await {
        Ok(()) => source.complete(&info).await,
        Err(TaskError::SkipRetry(msg)) => {
            warn!(task_id = %info.id, task_type = %info.task_type, error = %msg, "Task failed permanently");
            source.archive(&info, &msg).await
        }
        Err(TaskError::Retry(msg)) if info.retries_exhausted() => {
            warn!(
                task_id = %info.id,
                task_type = %info.task_type,
                retried = info.retried,
                error = %msg,
                "Task retries exhausted"
            );
            source.archive(&info, &msg).await
        }
        Err(TaskError::Retry(msg)) => {
            let delay = config.backoff(info.retried);
            debug!(
                task_id = %info.id,
                task_type = %info.task_type,
                delay_ms = delay.as_millis() as u64,
                error = %msg,
                "Task will be retried"
            );
            source.retry(&info, &msg, delay).await
        }
    };

    if let Err(e) = settled {
        error!(task_id = %info.id, error = %e, "Failed to settle task");
    }
}
