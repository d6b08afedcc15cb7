// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed task queue.
//!
//! Layout per queue `q`:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `authproxy:q:{q}:pending` | list | ids ready to run, pushed left, popped right |
//! | `authproxy:q:{q}:scheduled` | sorted set | retry ids scored by due time (ms) |
//! | `authproxy:q:{q}:active` | sorted set | dequeued ids scored by lease deadline (ms) |
//! | `authproxy:t:{id}` | string | JSON [`TaskInfo`], expiring after retention |
//!
//! Dequeue polls instead of blocking so a single multiplexed connection can
//! be shared by every worker. A dequeued id moves atomically onto the active
//! set; if its worker dies before settling it, the id returns to the pending
//! list once the lease runs out.

use std::time::Duration;

use async_trait::async_trait;
use authproxy_core::tasks::{EnqueueOptions, Task, TaskInfo, TaskQueue, TaskSource, TaskState};
use authproxy_core::{CoreError, Result};
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// How long archived tasks stay inspectable.
pub const ARCHIVE_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default time a dequeued task may run before it is handed out again.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// `RPOP` the pending list and lease the id in one step.
const TAKE_SCRIPT: &str = r"
local id = redis.call('RPOP', KEYS[1])
if id then
    redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
";

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const KEY_PREFIX: &str = "authproxy";

fn queue_error(operation: &str, e: impl std::fmt::Display) -> CoreError {
    CoreError::Queue {
        operation: operation.to_string(),
        details: e.to_string(),
    }
}

/// Task queue stored in Redis.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    prefix: String,
    lease: Duration,
}

impl RedisTaskQueue {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| queue_error("connect", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| queue_error("connect", e))?;
        Ok(Self {
            conn,
            prefix: KEY_PREFIX.to_string(),
            lease: DEFAULT_LEASE,
        })
    }

    /// Use a different key prefix, isolating this queue from others on the same server.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set how long a dequeued task may run before it is redelivered.
    ///
    /// Default: 5 minutes
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn pending_key(&self, queue: &str) -> String {
        format!("{}:q:{}:pending", self.prefix, queue)
    }

    fn scheduled_key(&self, queue: &str) -> String {
        format!("{}:q:{}:scheduled", self.prefix, queue)
    }

    fn active_key(&self, queue: &str) -> String {
        format!("{}:q:{}:active", self.prefix, queue)
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:t:{}", self.prefix, id)
    }

    async fn load(&self, id: &str) -> Result<Option<TaskInfo>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.task_key(id))
            .await
            .map_err(|e| queue_error("load", e))?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(|e| queue_error("load", e)))
            .transpose()
    }

    async fn store(&self, info: &TaskInfo, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(info).map_err(|e| queue_error("store", e))?;
        let key = self.task_key(&info.id);
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, raw, ttl.as_secs().max(1))
                .await
                .map_err(|e| queue_error("store", e)),
            None => conn
                .set::<_, _, ()>(key, raw)
                .await
                .map_err(|e| queue_error("store", e)),
        }
    }

    /// Move due retries and expired leases onto the pending list.
    async fn promote_due(&self, queue: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.promote(queue, &self.scheduled_key(queue), now).await?;

        let expired = self.promote(queue, &self.active_key(queue), now).await?;
        if expired > 0 {
            warn!(queue, expired, "Requeued tasks whose lease expired");
        }
        Ok(())
    }

    /// Re-queue ids of the sorted set `set` scored at or before `now`.
    async fn promote(&self, queue: &str, set: &str, now: i64) -> Result<usize> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(set, "-inf", now)
            .await
            .map_err(|e| queue_error("promote", e))?;

        let mut moved = 0;
        for id in due {
            // Only the worker that removes the entry re-queues it.
            let removed: i64 = conn
                .zrem(set, &id)
                .await
                .map_err(|e| queue_error("promote", e))?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(self.pending_key(queue), &id)
                    .await
                    .map_err(|e| queue_error("promote", e))?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Drop the lease of a settled task.
    async fn release(&self, info: &TaskInfo, operation: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(self.active_key(&info.queue), &info.id)
            .await
            .map_err(|e| queue_error(operation, e))
    }

    async fn try_take(&self, queue: &str) -> Result<Option<TaskInfo>> {
        self.promote_due(queue).await?;

        let mut conn = self.conn.clone();
        let script = redis::Script::new(TAKE_SCRIPT);
        loop {
            let deadline = Utc::now().timestamp_millis()
                + i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX / 2);
            let id: Option<String> = script
                .key(self.pending_key(queue))
                .key(self.active_key(queue))
                .arg(deadline)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| queue_error("dequeue", e))?;
            let Some(id) = id else {
                return Ok(None);
            };
            let Some(mut info) = self.load(&id).await? else {
                warn!(task_id = %id, queue, "Dropping queued id without task data");
                conn.zrem::<_, _, ()>(self.active_key(queue), &id)
                    .await
                    .map_err(|e| queue_error("dequeue", e))?;
                continue;
            };
            info.state = TaskState::Active;
            self.store(&info, None).await?;
            return Ok(Some(info));
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo> {
        let info = TaskInfo::pending(task, &opts);
        let raw = serde_json::to_string(&info).map_err(|e| queue_error("enqueue", e))?;

        let mut conn = self.conn.clone();
        let created: bool = conn
            .set_nx(self.task_key(&info.id), raw)
            .await
            .map_err(|e| queue_error("enqueue", e))?;
        if !created {
            return Err(CoreError::TaskExists { id: info.id });
        }
        conn.lpush::<_, _, ()>(self.pending_key(&info.queue), &info.id)
            .await
            .map_err(|e| queue_error("enqueue", e))?;

        debug!(task_id = %info.id, task_type = %info.task_type, queue = %info.queue, "Task enqueued");
        Ok(info)
    }

    async fn get_task_info(&self, queue: &str, id: &str) -> Result<TaskInfo> {
        self.load(id)
            .await?
            .filter(|info| info.queue == queue)
            .ok_or_else(|| CoreError::not_found("task", id))
    }
}

#[async_trait]
impl TaskSource for RedisTaskQueue {
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<TaskInfo>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(info) = self.try_take(queue).await? {
                return Ok(Some(info));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn complete(&self, info: &TaskInfo) -> Result<()> {
        self.release(info, "complete").await?;
        let mut done = info.clone();
        done.state = TaskState::Completed;
        done.completed_at = Some(Utc::now());

        if done.retention().is_zero() {
            let mut conn = self.conn.clone();
            return conn
                .del::<_, ()>(self.task_key(&done.id))
                .await
                .map_err(|e| queue_error("complete", e));
        }
        self.store(&done, Some(done.retention())).await
    }

    async fn retry(&self, info: &TaskInfo, error: &str, delay: Duration) -> Result<()> {
        let mut next = info.clone();
        next.state = TaskState::Retry;
        next.retried += 1;
        next.last_error = Some(error.to_string());
        next.process_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.store(&next, None).await?;

        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(
            self.scheduled_key(&next.queue),
            &next.id,
            next.process_at.timestamp_millis(),
        )
        .await
        .map_err(|e| queue_error("retry", e))?;
        self.release(info, "retry").await
    }

    async fn archive(&self, info: &TaskInfo, error: &str) -> Result<()> {
        self.release(info, "archive").await?;
        let mut archived = info.clone();
        archived.state = TaskState::Archived;
        archived.last_error = Some(error.to_string());
        archived.completed_at = Some(Utc::now());
        self.store(&archived, Some(ARCHIVE_RETENTION.max(archived.retention())))
            .await
    }
}
