// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector reconciliation.
//!
//! Syncs a declarative list of connector definitions into the versioned
//! store. A run has two phases:
//!
//! 1. **Precheck.** Every definition is checked against the rest of the batch
//!    and against the store. All violations are collected and reported
//!    together as [`CoreError::MigrationRejected`]; nothing is written.
//! 2. **Apply.** Definitions are applied one at a time in declaration order.
//!    Each resolves to an `(id, version, state)` target; when the stored
//!    version there already has the same content hash the definition is a
//!    no-op. A failure stops the run and leaves earlier writes in place, so a
//!    failed run is re-run rather than rolled back.
//!
//! Demoting the previous `primary` of an id is the store's job on upsert,
//! not the engine's.

mod apply;
mod precheck;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connector::{ConnectorDefinition, ConnectorVersionState};
use crate::error::{CoreError, Result};
use crate::labels::Labels;
use crate::namespace::ROOT_NAMESPACE;
use crate::service::CoreService;

/// Name of the lock serializing migrations across processes.
pub const MIGRATION_LOCK: &str = "connectors-migration";

/// Lease of the migration lock; a crashed holder loses it after this long.
pub const MIGRATION_LOCK_LEASE: Duration = Duration::from_secs(300);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Violations
// ============================================================================

/// One reason a batch of definitions was rejected.
///
/// `index` fields refer to positions in the submitted list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The definition is malformed.
    InvalidDefinition {
        /// Position of the definition.
        index: usize,
        /// What is wrong.
        message: String,
    },
    /// No id and none of the identifying labels.
    MissingIdentity {
        /// Position of the definition.
        index: usize,
    },
    /// Several definitions target the same identity.
    DuplicateIdentity {
        /// Rendered identity key.
        key: String,
        /// Positions of the clashing definitions.
        indices: Vec<usize>,
    },
    /// Definitions of one connector mix explicit and implicit version/state.
    InconsistentDifferentiation {
        /// Rendered connector identity.
        key: String,
        /// Positions of the definitions of that connector.
        indices: Vec<usize>,
    },
    /// More than one definition of a connector is `primary`, explicitly or by
    /// omitting the state.
    MultiplePrimary {
        /// Rendered connector identity.
        key: String,
        /// Positions of the primary definitions.
        indices: Vec<usize>,
    },
    /// A definition without id shares identifying labels with one that has an id.
    AmbiguousLabels {
        /// Position of the definition without id.
        index: usize,
        /// Position of the definition with id.
        other: usize,
        /// Rendered identifying labels.
        labels: String,
    },
    /// The definition would change the content of a published version.
    PublishedVersionImmutable {
        /// Position of the definition.
        index: usize,
        /// Connector id.
        id: Uuid,
        /// Published version.
        version: u64,
    },
    /// The definition would turn a published version back into a draft.
    DraftOfPublished {
        /// Position of the definition.
        index: usize,
        /// Connector id.
        id: Uuid,
        /// Published version.
        version: u64,
    },
    /// The identifying labels match several stored connectors.
    AmbiguousLabelMatch {
        /// Position of the definition.
        index: usize,
        /// Selector used for the lookup.
        selector: String,
        /// Matching connector ids.
        matches: Vec<Uuid>,
    },
}

fn join(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| format!("#{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDefinition { index, message } => {
                write!(f, "definition #{} is invalid: {}", index, message)
            }
            Self::MissingIdentity { index } => write!(
                f,
                "definition #{} has neither an id nor identifying labels",
                index
            ),
            Self::DuplicateIdentity { key, indices } => write!(
                f,
                "definitions {} share identity {}",
                join(indices),
                key
            ),
            Self::InconsistentDifferentiation { key, indices } => write!(
                f,
                "definitions {} of {} mix explicit and implicit version/state",
                join(indices),
                key
            ),
            Self::MultiplePrimary { key, indices } => write!(
                f,
                "definitions {} of {} are all declared primary",
                join(indices),
                key
            ),
            Self::AmbiguousLabels {
                index,
                other,
                labels,
            } => write!(
                f,
                "definition #{} has no id but shares labels {{{}}} with definition #{}",
                index, labels, other
            ),
            Self::PublishedVersionImmutable { index, id, version } => write!(
                f,
                "definition #{} changes published connector {}@{}",
                index, id, version
            ),
            Self::DraftOfPublished { index, id, version } => write!(
                f,
                "definition #{} declares published connector {}@{} as draft",
                index, id, version
            ),
            Self::AmbiguousLabelMatch {
                index,
                selector,
                matches,
            } => write!(
                f,
                "definition #{} labels '{}' match {} stored connectors",
                index,
                selector,
                matches.len()
            ),
        }
    }
}

/// All violations found by a precheck.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Violations(Vec<Violation>);

impl Violations {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation.
    pub fn push(&mut self, violation: Violation) {
        self.0.push(violation);
    }

    /// Append every violation of `other`.
    pub fn extend(&mut self, other: Violations) {
        self.0.extend(other.0);
    }

    /// Whether no violation was found.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of violations.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the violations.
    pub fn iter(&self) -> std::slice::Iter<'_, Violation> {
        self.0.iter()
    }
}

impl IntoIterator for Violations {
    type Item = Violation;
    type IntoIter = std::vec::IntoIter<Violation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s)", self.0.len())?;
        for v in &self.0 {
            write!(f, "; {}", v)?;
        }
        Ok(())
    }
}

// ============================================================================
// Report
// ============================================================================

/// What applying one definition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationAction {
    /// A new version was written.
    Created,
    /// A draft was overwritten with new content.
    Updated,
    /// Only the state of an existing version changed.
    StateChanged,
    /// Nothing was written.
    Unchanged,
}

/// Outcome of one definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Position in the submitted list.
    pub index: usize,
    /// Resolved connector id.
    pub id: Uuid,
    /// Resolved version.
    pub version: u64,
    /// Resulting state.
    pub state: ConnectorVersionState,
    /// Content hash.
    pub hash: String,
    /// What was done.
    pub action: MigrationAction,
}

/// Outcome of a migration run, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// One entry per applied definition.
    pub results: Vec<MigrationResult>,
}

impl MigrationReport {
    /// Number of definitions with the given action.
    pub fn count(&self, action: MigrationAction) -> usize {
        self.results.iter().filter(|r| r.action == action).count()
    }

    /// Number of store writes made.
    pub fn writes(&self) -> usize {
        self.results.len() - self.count(MigrationAction::Unchanged)
    }
}

// ============================================================================
// Entry points
// ============================================================================

impl CoreService {
    /// Reconcile the configured connectors under the migration lock.
    ///
    /// Waits up to the configured lock timeout for another process's
    /// migration to finish. Ensures the `root` namespace exists first.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        let holder = self.instance_id().to_string();
        let deadline = Instant::now() + self.migration_lock_timeout();

        loop {
            if self
                .store()
                .try_acquire_lock(MIGRATION_LOCK, &holder, MIGRATION_LOCK_LEASE)
                .await?
            {
                break;
            }
            if Instant::now() >= deadline {
                return Err(CoreError::LockTimeout {
                    name: MIGRATION_LOCK.to_string(),
                });
            }
            debug!(lock = MIGRATION_LOCK, "Waiting for migration lock");
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }

        let result = async {
            self.ensure_namespace_ancestor_path(ROOT_NAMESPACE, &Labels::new())
                .await?;
            self.migrate_connectors(self.configured_connectors(), &CancellationToken::new())
                .await
        }
        .await;

        if let Err(e) = self.store().release_lock(MIGRATION_LOCK, &holder).await {
            warn!(lock = MIGRATION_LOCK, error = %e, "Failed to release migration lock");
        }
        result
    }

    /// Reconcile `definitions` into the store.
    ///
    /// Rejects the whole batch before writing if any precheck fails.
    /// Cancelling `cancel` stops before the next definition is applied.
    pub async fn migrate_connectors(
        &self,
        definitions: &[ConnectorDefinition],
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        let mut violations = precheck::check_batch(definitions, self.identifying_labels());
        violations.extend(precheck::check_store(self, definitions).await?);
        if !violations.is_empty() {
            warn!(
                definitions = definitions.len(),
                violations = violations.len(),
                "Connector migration rejected"
            );
            return Err(CoreError::MigrationRejected(violations));
        }

        let mut report = MigrationReport::default();
        for (index, definition) in definitions.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    applied = index,
                    remaining = definitions.len() - index,
                    "Connector migration cancelled"
                );
                return Err(CoreError::Cancelled);
            }
            let result = apply::apply_definition(self, index, definition).await?;
            report.results.push(result);
        }

        info!(
            definitions = definitions.len(),
            created = report.count(MigrationAction::Created),
            updated = report.count(MigrationAction::Updated),
            state_changed = report.count(MigrationAction::StateChanged),
            unchanged = report.count(MigrationAction::Unchanged),
            "Connector migration complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{definition, service};

    #[test]
    fn test_violations_display_lists_all() {
        let mut v = Violations::new();
        v.push(Violation::MissingIdentity { index: 0 });
        v.push(Violation::DuplicateIdentity {
            key: "labels{type=fake}".to_string(),
            indices: vec![1, 2],
        });
        let text = CoreError::MigrationRejected(v).to_string();
        assert!(text.contains("2 violation(s)"));
        assert!(text.contains("#0"));
        assert!(text.contains("#1, #2"));
    }

    #[tokio::test]
    async fn test_migrate_configured_connectors() {
        let (svc, _) = service().await;
        let svc = CoreService::builder()
            .store(svc.store().clone())
            .encrypt(svc.encrypt_service().clone())
            .queue(svc.queue().clone())
            .connectors(vec![definition("fake", "Fake")])
            .build()
            .unwrap();

        let report = svc.migrate().await.unwrap();
        assert_eq!(report.count(MigrationAction::Created), 1);
        assert!(svc.get_namespace("root").await.is_ok());

        let report = svc.migrate().await.unwrap();
        assert_eq!(report.writes(), 0);
    }

    #[tokio::test]
    async fn test_migrate_times_out_on_held_lock() {
        let (svc, _) = service().await;
        let svc = CoreService::builder()
            .store(svc.store().clone())
            .encrypt(svc.encrypt_service().clone())
            .queue(svc.queue().clone())
            .migration_lock_timeout(Duration::from_millis(300))
            .build()
            .unwrap();

        assert!(
            svc.store()
                .try_acquire_lock(MIGRATION_LOCK, "someone-else", MIGRATION_LOCK_LEASE)
                .await
                .unwrap()
        );
        let err = svc.migrate().await.unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        assert!(err.is_retriable());

        svc.store()
            .release_lock(MIGRATION_LOCK, "someone-else")
            .await
            .unwrap();
        assert!(svc.migrate().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_definition() {
        let (svc, _) = service().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = svc
            .migrate_connectors(&[definition("fake", "Fake")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(
            svc.list_connectors_builder()
                .fetch_page()
                .await
                .unwrap()
                .items
                .is_empty()
        );
    }
}
