// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authproxy Core - Connector and Connection Lifecycle
//!
//! This crate owns the multi-tenant model behind authproxy: hierarchical
//! namespaces, versioned connectors, the connections bound to them, and the
//! background work that keeps both in shape.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     CoreService (this crate)                      │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │ Namespaces │  │ Connectors │  │ Migration  │  │Connections │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//!        │                  │                               │
//!        ▼                  ▼                               ▼
//! ┌──────────────┐  ┌────────────────┐              ┌──────────────┐
//! │  Persistence │  │ EncryptService │              │  TaskQueue   │
//! │   (SQLite)   │  │   (AES-GCM)    │              │ (worker/redis│
//! └──────────────┘  └────────────────┘              │  or memory)  │
//!                                                   └──────────────┘
//! ```
//!
//! # Connector Version States
//!
//! ```text
//!   ┌───────┐  publish   ┌─────────┐  newer primary  ┌────────┐
//!   │ DRAFT │───────────►│ PRIMARY │────────────────►│ ACTIVE │
//!   └───────┘            └─────────┘                 └────────┘
//! ```
//!
//! A draft is the only editable state; published versions keep their content
//! hash forever. At most one version per connector is primary.
//!
//! # Connection States
//!
//! ```text
//!   CREATED ──► READY ──► DISCONNECTING ──► DISCONNECTED ──► (deleted)
//!      └───────────────────────▲
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AUTHPROXY_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `AUTHPROXY_ENCRYPTION_KEY` | Yes | - | Base64 encoded 32 byte master key |
//! | `AUTHPROXY_CONNECTORS_FILE` | No | - | JSON file of connector declarations |
//! | `AUTHPROXY_IDENTIFYING_LABELS` | No | `type` | Label keys identifying a connector |
//! | `AUTHPROXY_DISCONNECT_RETENTION_SECS` | No | `600` | Disconnect task retention |
//! | `AUTHPROXY_MIGRATION_LOCK_TIMEOUT_SECS` | No | `60` | Wait for the migration lock |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`connection`]: Connections and their lifecycle
//! - [`connector`]: Connector definitions, versions and the version builder
//! - [`encrypt`]: At-rest encryption of connector definitions
//! - [`migration`]: Reconciliation of declared connectors into the store
//! - [`namespace`]: Hierarchical namespaces
//! - [`persistence`]: Store trait and SQLite backend
//! - [`probe`]: Health probes and their schedules
//! - [`tasks`]: Task queue traits and the core task handlers

/// Configuration loaded from environment variables.
pub mod config;

/// Connections bound to connector versions.
pub mod connection;

/// Connector definitions and versions.
pub mod connector;

/// At-rest encryption.
pub mod encrypt;

/// Error types for core operations.
pub mod error;

/// Outbound HTTP requests on behalf of connections.
pub mod httpf;

/// Labels and label selectors.
pub mod labels;

/// Declarative connector reconciliation.
pub mod migration;

/// Database schema migrations.
pub mod migrations;

/// Hierarchical namespaces.
pub mod namespace;

/// OAuth2 collaborator seam.
pub mod oauth2;

/// Cursor pagination helpers.
pub mod pagination;

/// Store trait and backends.
pub mod persistence;

/// Health probes.
pub mod probe;

/// The lifecycle service.
pub mod service;

/// Background tasks.
pub mod tasks;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError};
pub use connection::{ConnectionEntity, ConnectionState};
pub use connector::{
    Connector, ConnectorDefinition, ConnectorVersion, ConnectorVersionBuilder,
    ConnectorVersionState,
};
pub use encrypt::{AesGcmEncryptService, EncryptService};
pub use error::{CoreError, Result};
pub use labels::{LabelSelector, Labels};
pub use migration::{MigrationAction, MigrationReport, MigrationResult, Violation, Violations};
pub use namespace::{Namespace, NamespaceMatcher, ROOT_NAMESPACE};
pub use pagination::Page;
pub use persistence::{Persistence, SqlitePersistence};
pub use probe::{CronTask, ProbeOutcome, ProbeSchedule};
pub use service::{CoreService, CoreServiceBuilder};
pub use tasks::{Task, TaskError, TaskHandler, TaskInfo, TaskMux, TaskQueue, TaskSource};
