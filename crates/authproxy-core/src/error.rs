// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for authproxy-core.
//!
//! Every layer (builder, store, migration engine, lifecycle service) returns
//! [`CoreError`]. Callers classify errors with [`CoreError::is_retriable`] and
//! [`CoreError::is_not_found`] rather than matching on variants.

use thiserror::Error;
use uuid::Uuid;

use crate::connector::ConnectorVersionState;
use crate::migration::Violations;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while managing namespaces, connectors and connections.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Entity was not found in the store.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of entity (namespace, connector version, connection, probe).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Namespace path or matcher is malformed.
    #[error("Invalid namespace path '{path}': {reason}")]
    InvalidNamespacePath {
        /// The rejected path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A connector version was built without a definition.
    #[error("Connector version builder has no definition")]
    NilDefinition,

    /// A draft already exists for the connector.
    #[error("Connector '{id}' already has a draft at version {version}")]
    DraftAlreadyExists {
        /// Connector id.
        id: Uuid,
        /// Version of the existing draft.
        version: u64,
    },

    /// The addressed version is not a draft and cannot be edited.
    #[error("Connector '{id}' version {version} is not a draft (state '{state}')")]
    NotDraft {
        /// Connector id.
        id: Uuid,
        /// Addressed version.
        version: u64,
        /// Actual state of the version.
        state: ConnectorVersionState,
    },

    /// A published version would change content.
    #[error("Connector '{id}' version {version} is published and its definition cannot change")]
    PublishedVersionImmutable {
        /// Connector id.
        id: Uuid,
        /// Published version.
        version: u64,
    },

    /// A connection state transition is not allowed from its current state.
    #[error("Connection '{id}' cannot transition from '{from}' to '{to}'")]
    InvalidStateTransition {
        /// Connection id.
        id: Uuid,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Connector migration precheck failed; no writes were made.
    #[error("Connector migration rejected: {0}")]
    MigrationRejected(Violations),

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Task queue operation failed.
    #[error("Task queue error during '{operation}': {details}")]
    Queue {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A task with the requested id is already known to the queue.
    #[error("Task '{id}' already exists")]
    TaskExists {
        /// The duplicate task id.
        id: String,
    },

    /// Encryption or decryption failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Outbound HTTP request could not be built or sent.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A named lock could not be acquired in time.
    #[error("Timed out waiting for lock '{name}'")]
    LockTimeout {
        /// Lock name.
        name: String,
    },

    /// The operation was cancelled before completion.
    #[error("Operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Shorthand for a [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for a [`CoreError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidNamespacePath { .. } => "INVALID_NAMESPACE_PATH",
            Self::NilDefinition => "NIL_DEFINITION",
            Self::DraftAlreadyExists { .. } => "DRAFT_ALREADY_EXISTS",
            Self::NotDraft { .. } => "NOT_DRAFT",
            Self::PublishedVersionImmutable { .. } => "PUBLISHED_VERSION_IMMUTABLE",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::MigrationRejected(_) => "MIGRATION_REJECTED",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Queue { .. } => "QUEUE_ERROR",
            Self::TaskExists { .. } => "TASK_EXISTS",
            Self::Encryption(_) => "ENCRYPTION_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Store and queue failures are transient; everything else needs the
    /// caller to change its input or accept the outcome.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Queue { .. } | Self::LockTimeout { .. }
        )
    }

    /// Whether this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation {
            field: "json".to_string(),
            message: err.to_string(),
        }
    }
}
