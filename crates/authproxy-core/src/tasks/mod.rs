// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background task queue abstractions and the core task handlers.
//!
//! Clients enqueue through [`TaskQueue`]; workers consume through
//! [`TaskSource`] and dispatch by task type through a [`TaskMux`]. Handlers
//! report failures as [`TaskError`], whose variant decides whether the queue
//! redelivers the task.

mod disconnect;
mod memory;
mod migrate;
mod probe;

pub use disconnect::{DisconnectConnectionHandler, DisconnectConnectionPayload};
pub use memory::MemoryTaskQueue;
pub use migrate::MigrateConnectorsHandler;
pub use probe::{InvokeProbeHandler, InvokeProbePayload};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::{CoreError, Result};

/// Task type of the asynchronous disconnect workflow.
pub const TASK_TYPE_DISCONNECT_CONNECTION: &str = "connection:disconnect";

/// Task type of one probe invocation.
pub const TASK_TYPE_INVOKE_PROBE: &str = "probe:invoke";

/// Task type of a connector reconciliation run.
pub const TASK_TYPE_MIGRATE_CONNECTORS: &str = "connectors:migrate";

/// Queue used when none is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget when none is specified.
pub const DEFAULT_MAX_RETRY: u32 = 25;

// ============================================================================
// Tasks
// ============================================================================

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Routing key for the handler.
    pub task_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
}

impl Task {
    /// Create a task with a serialized payload.
    pub fn new<T: Serialize>(task_type: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            task_type: task_type.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload; a malformed payload is never retried.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, TaskError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            TaskError::SkipRetry(format!(
                "invalid payload for task '{}': {}",
                self.task_type, e
            ))
        })
    }
}

/// Options for [`TaskQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Target queue.
    pub queue: String,
    /// Maximum number of retries before the task is archived.
    pub max_retry: u32,
    /// How long the task's result is kept after completion.
    pub retention: Duration,
    /// Explicit task id; duplicate live ids are rejected.
    pub task_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            retention: Duration::ZERO,
            task_id: None,
        }
    }
}

impl EnqueueOptions {
    /// Set the retention window.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the retry budget.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set the target queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set an explicit task id.
    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }
}

/// Lifecycle state of an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be processed.
    Pending,
    /// Being processed by a worker.
    Active,
    /// Failed, waiting for its next attempt.
    Retry,
    /// Processed successfully; kept for the retention window.
    Completed,
    /// Failed permanently; kept for inspection.
    Archived,
}

impl TaskState {
    /// String representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// Whether the task will not run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Archived)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-side view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task id.
    pub id: String,
    /// Queue name.
    pub queue: String,
    /// Task type.
    pub task_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Current state.
    pub state: TaskState,
    /// Number of retries so far.
    pub retried: u32,
    /// Retry budget.
    pub max_retry: u32,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Retention after completion, in seconds.
    pub retention_secs: u64,
    /// When the task was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the task may be processed.
    pub process_at: DateTime<Utc>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Build the pending info for a freshly enqueued task.
    pub fn pending(task: Task, opts: &EnqueueOptions) -> Self {
        let now = Utc::now();
        Self {
            id: opts
                .task_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            queue: opts.queue.clone(),
            task_type: task.task_type,
            payload: task.payload,
            state: TaskState::Pending,
            retried: 0,
            max_retry: opts.max_retry,
            last_error: None,
            retention_secs: opts.retention.as_secs(),
            enqueued_at: now,
            process_at: now,
            completed_at: None,
        }
    }

    /// The task carried by this info.
    pub fn task(&self) -> Task {
        Task {
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Retention window.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Whether the retry budget is used up.
    pub fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }
}

// ============================================================================
// Queue traits
// ============================================================================

/// Client side of the task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task.
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo>;

    /// Look up a task still known to the queue.
    async fn get_task_info(&self, queue: &str, id: &str) -> Result<TaskInfo>;
}

/// Worker side of the task queue.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Take the next ready task, waiting up to `timeout`.
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<TaskInfo>>;

    /// Mark a task completed.
    async fn complete(&self, info: &TaskInfo) -> Result<()>;

    /// Schedule another attempt after `delay`.
    async fn retry(&self, info: &TaskInfo, error: &str, delay: Duration) -> Result<()>;

    /// Give up on a task.
    async fn archive(&self, info: &TaskInfo, error: &str) -> Result<()>;
}

// ============================================================================
// Handlers
// ============================================================================

/// Failure of a task handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure; the queue should redeliver.
    #[error("{0}")]
    Retry(String),
    /// Permanent failure; the task is archived without further attempts.
    #[error("{0}")]
    SkipRetry(String),
}

impl TaskError {
    /// Whether the queue should redeliver the task.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    /// Classify a core error with [`CoreError::is_retriable`].
    pub fn classify(err: CoreError) -> Self {
        if err.is_retriable() {
            Self::Retry(err.to_string())
        } else {
            Self::SkipRetry(err.to_string())
        }
    }

    /// Treat a core error as transient regardless of its kind.
    pub fn retry(err: CoreError) -> Self {
        Self::Retry(err.to_string())
    }
}

impl From<CoreError> for TaskError {
    fn from(err: CoreError) -> Self {
        Self::classify(err)
    }
}

/// Processes one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process a task.
    async fn handle(&self, task: &Task) -> std::result::Result<(), TaskError>;
}

/// Routes tasks to handlers by task type.
#[derive(Default, Clone)]
pub struct TaskMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskMux {
    /// Create an empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`, replacing any previous handler.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            warn!(task_type = %task_type, "Replacing task handler");
        }
    }

    /// Whether a handler is registered for `task_type`.
    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl TaskHandler for TaskMux {
    async fn handle(&self, task: &Task) -> std::result::Result<(), TaskError> {
        match self.handlers.get(&task.task_type) {
            Some(handler) => handler.handle(task).await,
            None => Err(TaskError::SkipRetry(format!(
                "no handler registered for task type '{}'",
                task.task_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _task: &Task) -> std::result::Result<(), TaskError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mux_routes_by_type() {
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let mut mux = TaskMux::new();
        mux.register("a:b", handler.clone());

        let task = Task::new("a:b", &serde_json::json!({})).unwrap();
        mux.handle(&task).await.unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);

        let unknown = Task::new("x:y", &serde_json::json!({})).unwrap();
        let err = mux.handle(&unknown).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_classify_core_errors() {
        let db = CoreError::Database {
            operation: "update".to_string(),
            details: "locked".to_string(),
        };
        assert!(TaskError::from(db).is_retriable());
        assert!(!TaskError::from(CoreError::not_found("connection", "x")).is_retriable());
        assert!(TaskError::retry(CoreError::not_found("connection", "x")).is_retriable());
    }

    #[test]
    fn test_decode_bad_payload_skips_retry() {
        #[derive(Debug, Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            id: u32,
        }
        let task = Task::new("t", &serde_json::json!({"id": "nope"})).unwrap();
        let err = task.decode::<Payload>().unwrap_err();
        assert!(matches!(err, TaskError::SkipRetry(_)));
    }

    #[test]
    fn test_enqueue_options_defaults() {
        let opts = EnqueueOptions::default().retention(Duration::from_secs(600));
        assert_eq!(opts.queue, DEFAULT_QUEUE);
        assert_eq!(opts.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(opts.retention, Duration::from_secs(600));
    }
}
