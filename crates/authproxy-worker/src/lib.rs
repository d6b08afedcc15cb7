// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authproxy Worker - Background Task Processing
//!
//! Runs the asynchronous half of the connection lifecycle:
//!
//! - **Task worker**: consumes `connection:disconnect`, `probe:invoke` and
//!   `connectors:migrate` tasks with bounded concurrency and exponential
//!   retry backoff
//! - **Probe scheduler**: enqueues `probe:invoke` for every periodic probe of
//!   every live connection when it comes due
//! - **Startup reconciliation**: applies the configured connector definitions
//!   under the migration lock before tasks are processed
//!
//! ```text
//!  ┌──────────────────┐  enqueue   ┌─────────────────┐  dequeue  ┌─────────────┐
//!  │  CoreService     │──────────▶│   Task queue     │─────────▶│ TaskWorker  │
//!  │  (disconnect)    │           │ (Redis/memory)   │          │  + TaskMux  │
//!  └──────────────────┘           └─────────────────┘          └─────────────┘
//!           ▲                              ▲
//!           │ get_cron_tasks               │ probe:invoke
//!  ┌──────────────────┐                    │
//!  │ ProbeScheduler   │────────────────────┘
//!  └──────────────────┘
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AUTHPROXY_DATABASE_URL` | Yes | - | SQLite file path or `sqlite:` URL |
//! | `AUTHPROXY_ENCRYPTION_KEY` | Yes | - | Base64 AES-256 master key |
//! | `AUTHPROXY_REDIS_URL` | No | in-process | Redis task queue |
//! | `AUTHPROXY_WORKER_QUEUE` | No | `default` | Queue to consume |
//! | `AUTHPROXY_WORKER_CONCURRENCY` | No | `4` | Concurrent tasks |
//! | `AUTHPROXY_PROBE_REFRESH_SECS` | No | `60` | Probe schedule reload interval |
//! | `AUTHPROXY_MIGRATE_ON_START` | No | `true` | Reconcile connectors at startup |

pub mod config;
pub mod probe_scheduler;
pub mod redis_queue;
pub mod runtime;
pub mod task_worker;

pub use config::{Config, ConfigError};
pub use probe_scheduler::{ProbeScheduler, ProbeSchedulerConfig};
pub use redis_queue::RedisTaskQueue;
pub use runtime::{WorkerRuntime, WorkerRuntimeBuilder, WorkerRuntimeConfig};
pub use task_worker::{TaskWorker, TaskWorkerConfig};
