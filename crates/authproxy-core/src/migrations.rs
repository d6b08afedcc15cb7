// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for authproxy-core.
//!
//! This module exposes the embedded schema migrations so embedding processes
//! can set up the database before constructing a [`SqlitePersistence`].
//!
//! These are schema migrations; reconciling declared connectors into the
//! store is the job of [`crate::migration`].
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use authproxy_core::migrations;
//!
//! let pool = SqlitePool::connect(&database_url).await?;
//! migrations::run_sqlite(&pool).await?;
//! ```
//!
//! [`SqlitePersistence`]: crate::persistence::SqlitePersistence

use sqlx::migrate::MigrateError;

/// SQLite migrator with all core migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
