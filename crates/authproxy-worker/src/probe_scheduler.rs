// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Probe scheduler.
//!
//! Periodically reloads the periodic probes of live connections and enqueues
//! a `probe:invoke` task whenever one comes due.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use authproxy_core::probe::{CronTask, ProbeSchedule};
use authproxy_core::tasks::{
    DEFAULT_QUEUE, EnqueueOptions, InvokeProbePayload, TASK_TYPE_INVOKE_PROBE, Task,
};
use authproxy_core::{CoreError, CoreService, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// How long a fired probe task id stays reserved after completion.
const FIRED_TASK_RETENTION: Duration = Duration::from_secs(300);

/// Probe scheduler configuration.
#[derive(Debug, Clone)]
pub struct ProbeSchedulerConfig {
    /// How often the set of periodic probes is reloaded.
    pub refresh_interval: Duration,
    /// How often due probes are checked.
    pub tick_interval: Duration,
    /// Queue probe tasks are enqueued on.
    pub queue: String,
}

impl Default for ProbeSchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

struct Entry {
    task: CronTask,
    schedule: ProbeSchedule,
    next: DateTime<Utc>,
}

/// Probe scheduler that runs as a background task.
pub struct ProbeScheduler {
    service: CoreService,
    config: ProbeSchedulerConfig,
    entries: HashMap<String, Entry>,
    shutdown: Arc<Notify>,
}

impl ProbeScheduler {
    /// Create a new probe scheduler.
    pub fn new(service: CoreService, config: ProbeSchedulerConfig) -> Self {
        Self {
            service,
            config,
            entries: HashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Number of scheduled probes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no probe is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the scheduler loop.
    pub async fn run(mut self) {
        info!(
            refresh_interval_secs = self.config.refresh_interval.as_secs(),
            "Probe scheduler started"
        );

        let mut last_refresh: Option<tokio::time::Instant> = None;
        loop {
            if last_refresh.is_none_or(|t| t.elapsed() >= self.config.refresh_interval) {
                if let Err(e) = self.refresh(Utc::now()).await {
                    error!(error = %e, "Failed to refresh probe schedules");
                }
                last_refresh = Some(tokio::time::Instant::now());
            }

            let fired = self.fire_due(Utc::now()).await;
            if fired > 0 {
                debug!(fired, "Enqueued due probes");
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Probe scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }
    }

    /// Reload periodic probes, keeping the next fire time of unchanged ones.
    pub async fn refresh(&mut self, now: DateTime<Utc>) -> Result<()> {
        let tasks = self.service.get_cron_tasks().await?;
        self.reschedule(tasks, now);
        Ok(())
    }

    /// Replace the scheduled probes with `tasks`.
    ///
    /// A probe whose schedule cannot be evaluated is skipped with a warning.
    /// Returns the number of probes newly scheduled.
    pub fn reschedule(&mut self, tasks: Vec<CronTask>, now: DateTime<Utc>) -> usize {
        let mut previous = std::mem::take(&mut self.entries);
        let mut added = 0;

        for task in tasks {
            let key = task.key();
            if let Some(existing) = previous.remove(&key)
                && existing.task.schedule == task.schedule
            {
                self.entries.insert(key, existing);
                continue;
            }

            let schedule = match ProbeSchedule::parse(&task.schedule) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(key = %key, schedule = %task.schedule, error = %e, "Skipping probe with bad schedule");
                    continue;
                }
            };
            let next = match schedule.next_after(now) {
                Ok(Some(next)) => next,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        key = %key,
                        schedule = %task.schedule,
                        error = %e,
                        "Skipping probe without a next occurrence"
                    );
                    continue;
                }
            };
            self.entries.insert(
                key,
                Entry {
                    task,
                    schedule,
                    next,
                },
            );
            added += 1;
        }

        debug!(
            scheduled = self.entries.len(),
            added,
            removed = previous.len(),
            "Probe schedules refreshed"
        );
        added
    }

    /// Enqueue every probe due at `now` and advance its next fire time.
    ///
    /// Returns the number of tasks enqueued.
    pub async fn fire_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for (key, entry) in self.entries.iter_mut() {
            if entry.next > now {
                continue;
            }

            let payload = InvokeProbePayload {
                connection_id: entry.task.connection_id,
                probe_id: entry.task.probe_id.clone(),
            };
            // Schedulers sharing a queue compute the same id for one occurrence.
            let opts = EnqueueOptions::default()
                .queue(self.config.queue.clone())
                .task_id(format!("{}:{}", key, entry.next.timestamp_millis()))
                .retention(FIRED_TASK_RETENTION);
            let enqueued = match Task::new(TASK_TYPE_INVOKE_PROBE, &payload) {
                Ok(task) => self.service.queue().enqueue(task, opts).await,
                Err(e) => Err(e),
            };
            match enqueued {
                Ok(_) => fired += 1,
                Err(CoreError::TaskExists { id }) => {
                    debug!(key = %key, task_id = %id, "Probe already enqueued by another scheduler");
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to enqueue probe");
                    continue;
                }
            }

            match entry.schedule.next_after(now) {
                Ok(Some(next)) => entry.next = next,
                Ok(None) => entry.next = DateTime::<Utc>::MAX_UTC,
                Err(e) => {
                    warn!(key = %key, error = %e, "Probe schedule has no next occurrence");
                    entry.next = DateTime::<Utc>::MAX_UTC;
                }
            }
        }
        fired
    }
}
