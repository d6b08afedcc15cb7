// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process task queue.
//!
//! Used by single-process deployments and tests. Tasks live only as long as
//! the queue value.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;

use super::{EnqueueOptions, Task, TaskInfo, TaskQueue, TaskSource, TaskState};
use crate::error::{CoreError, Result};

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, TaskInfo>,
    /// Enqueue order of task ids; dequeue scans it for the first ready task.
    order: Vec<String>,
}

impl QueueState {
    fn purge_expired(&mut self) {
        let now = Utc::now();
        self.tasks.retain(|_, info| match info.completed_at {
            Some(done) if info.state.is_terminal() => {
                let retention = chrono::Duration::seconds(info.retention_secs as i64);
                done + retention > now
            }
            _ => true,
        });
        let tasks = &self.tasks;
        self.order.retain(|id| {
            tasks
                .get(id)
                .is_some_and(|t| matches!(t.state, TaskState::Pending | TaskState::Retry))
        });
    }
}

/// Task queue held in memory.
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryTaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run in `queue`.
    pub fn pending_count(&self, queue: &str) -> usize {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.queue == queue)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A poisoned lock only means a panic elsewhere; the map is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, info: &TaskInfo, f: impl FnOnce(&mut TaskInfo)) -> Result<()> {
        let mut state = self.lock();
        let task = state.tasks.get_mut(&info.id).ok_or_else(|| CoreError::Queue {
            operation: "update".to_string(),
            details: format!("task '{}' not found", info.id),
        })?;
        f(task);
        state.purge_expired();
        Ok(())
    }

    /// Take the first ready task of `queue`, or the delay until one is ready.
    fn try_take(&self, queue: &str) -> std::result::Result<TaskInfo, Option<Duration>> {
        let mut state = self.lock();
        state.purge_expired();
        let now = Utc::now();

        let mut next_wait: Option<Duration> = None;
        let mut found = None;
        for (pos, id) in state.order.iter().enumerate() {
            let Some(task) = state.tasks.get(id) else {
                continue;
            };
            if task.queue != queue {
                continue;
            }
            if task.process_at <= now {
                found = Some(pos);
                break;
            }
            let wait = (task.process_at - now).to_std().unwrap_or_default();
            next_wait = Some(next_wait.map_or(wait, |w| w.min(wait)));
        }

        let Some(pos) = found else {
            return Err(next_wait);
        };
        let id = state.order.remove(pos);
        match state.tasks.get_mut(&id) {
            Some(task) => {
                task.state = TaskState::Active;
                Ok(task.clone())
            }
            None => Err(next_wait),
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo> {
        let info = TaskInfo::pending(task, &opts);
        {
            let mut state = self.lock();
            state.purge_expired();
            if state.tasks.contains_key(&info.id) {
                return Err(CoreError::TaskExists { id: info.id });
            }
            state.order.push(info.id.clone());
            state.tasks.insert(info.id.clone(), info.clone());
        }
        debug!(task_id = %info.id, task_type = %info.task_type, queue = %info.queue, "Task enqueued");
        self.notify.notify_waiters();
        Ok(info)
    }

    async fn get_task_info(&self, queue: &str, id: &str) -> Result<TaskInfo> {
        let mut state = self.lock();
        state.purge_expired();
        state
            .tasks
            .get(id)
            .filter(|t| t.queue == queue)
            .cloned()
            .ok_or_else(|| CoreError::not_found("task", id))
    }
}

#[async_trait]
impl TaskSource for MemoryTaskQueue {
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<TaskInfo>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent enqueue is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = match self.try_take(queue) {
                Ok(info) => return Ok(Some(info)),
                Err(wait) => wait,
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline - now;
            let sleep_for = wait.map_or(remaining, |w| w.min(remaining));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn complete(&self, info: &TaskInfo) -> Result<()> {
        self.update(info, |task| {
            task.state = TaskState::Completed;
            task.completed_at = Some(Utc::now());
        })
    }

    async fn retry(&self, info: &TaskInfo, error: &str, delay: Duration) -> Result<()> {
        let delay = chrono::Duration::from_std(delay).unwrap_or_default();
        {
            let mut state = self.lock();
            let task = state.tasks.get_mut(&info.id).ok_or_else(|| CoreError::Queue {
                operation: "retry".to_string(),
                details: format!("task '{}' not found", info.id),
            })?;
            task.state = TaskState::Retry;
            task.retried += 1;
            task.last_error = Some(error.to_string());
            task.process_at = Utc::now() + delay;
            let id = task.id.clone();
            state.order.push(id);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn archive(&self, info: &TaskInfo, error: &str) -> Result<()> {
        self.update(info, |task| {
            task.state = TaskState::Archived;
            task.last_error = Some(error.to_string());
            task.completed_at = Some(Utc::now());
        })
    }
}
