// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch and store prechecks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use uuid::Uuid;

use super::{Violation, Violations};
use crate::connector::{ConnectorDefinition, ConnectorVersionState};
use crate::error::Result;
use crate::labels::{LabelSelector, Labels};
use crate::service::CoreService;

/// What a definition targets before any store lookup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Subject {
    Id(Uuid),
    Labels(String),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "connector {}", id),
            Self::Labels(labels) => write!(f, "labels{{{}}}", labels),
        }
    }
}

fn render_labels(labels: &Labels) -> String {
    LabelSelector::from_labels(labels).to_string()
}

fn subject(def: &ConnectorDefinition, keys: &[String]) -> Option<Subject> {
    if let Some(id) = def.id {
        return Some(Subject::Id(id));
    }
    let labels = def.identifying_labels(keys);
    if labels.is_empty() {
        None
    } else {
        Some(Subject::Labels(render_labels(&labels)))
    }
}

/// Identity key within a subject: the version when given, else the state.
fn differentiator(
    def: &ConnectorDefinition,
) -> (Option<u64>, Option<ConnectorVersionState>) {
    match def.version {
        Some(version) => (Some(version), None),
        None => (None, def.state),
    }
}

fn render_key(
    subject: &Subject,
    (version, state): (Option<u64>, Option<ConnectorVersionState>),
) -> String {
    match (version, state) {
        (Some(v), _) => format!("{} version {}", subject, v),
        (None, Some(s)) => format!("{} state {}", subject, s),
        (None, None) => subject.to_string(),
    }
}

/// Checks that need only the batch itself.
pub(super) fn check_batch(definitions: &[ConnectorDefinition], keys: &[String]) -> Violations {
    let mut violations = Violations::new();
    let mut by_subject: BTreeMap<Subject, Vec<usize>> = BTreeMap::new();

    for (index, def) in definitions.iter().enumerate() {
        if let Err(e) = def.validate() {
            violations.push(Violation::InvalidDefinition {
                index,
                message: e.to_string(),
            });
        }
        match subject(def, keys) {
            Some(s) => by_subject.entry(s).or_default().push(index),
            None => violations.push(Violation::MissingIdentity { index }),
        }
    }

    for (subject, indices) in &by_subject {
        let mut by_key: BTreeMap<(Option<u64>, Option<ConnectorVersionState>), Vec<usize>> =
            BTreeMap::new();
        for &i in indices {
            by_key
                .entry(differentiator(&definitions[i]))
                .or_default()
                .push(i);
        }
        for (key, clashing) in by_key {
            if clashing.len() > 1 {
                violations.push(Violation::DuplicateIdentity {
                    key: render_key(subject, key),
                    indices: clashing,
                });
            }
        }

        let explicit = indices
            .iter()
            .filter(|&&i| definitions[i].version.is_some() || definitions[i].state.is_some())
            .count();
        if indices.len() > 1 && explicit > 0 && explicit < indices.len() {
            violations.push(Violation::InconsistentDifferentiation {
                key: subject.to_string(),
                indices: indices.clone(),
            });
        }

        let primaries: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| {
                definitions[i].state.unwrap_or_default() == ConnectorVersionState::Primary
            })
            .collect();
        if primaries.len() > 1 {
            violations.push(Violation::MultiplePrimary {
                key: subject.to_string(),
                indices: primaries,
            });
        }
    }

    let mut with_id: HashMap<String, usize> = HashMap::new();
    for (index, def) in definitions.iter().enumerate() {
        if def.id.is_none() {
            continue;
        }
        let labels = def.identifying_labels(keys);
        if !labels.is_empty() {
            with_id.entry(render_labels(&labels)).or_insert(index);
        }
    }
    for (index, def) in definitions.iter().enumerate() {
        if def.id.is_some() {
            continue;
        }
        let labels = def.identifying_labels(keys);
        if labels.is_empty() {
            continue;
        }
        let rendered = render_labels(&labels);
        if let Some(&other) = with_id.get(&rendered) {
            violations.push(Violation::AmbiguousLabels {
                index,
                other,
                labels: rendered,
            });
        }
    }

    violations
}

/// Connector ids whose stored labels match the identifying labels of `def`.
pub(super) async fn lookup_by_labels(
    service: &CoreService,
    def: &ConnectorDefinition,
) -> Result<(LabelSelector, Vec<Uuid>)> {
    let labels = def.identifying_labels(service.identifying_labels());
    if labels.is_empty() {
        return Ok((LabelSelector::default(), Vec::new()));
    }
    let selector = LabelSelector::from_labels(&labels);
    let matches = service
        .store()
        .find_connector_ids_by_labels(&selector)
        .await?;
    Ok((selector, matches))
}

/// Checks against the current store contents. Store errors abort the check.
pub(super) async fn check_store(
    service: &CoreService,
    definitions: &[ConnectorDefinition],
) -> Result<Violations> {
    let mut violations = Violations::new();

    for (index, def) in definitions.iter().enumerate() {
        let id = match def.id {
            Some(id) => Some(id),
            None => {
                let (selector, matches) = lookup_by_labels(service, def).await?;
                if matches.len() > 1 {
                    violations.push(Violation::AmbiguousLabelMatch {
                        index,
                        selector: selector.to_string(),
                        matches,
                    });
                    continue;
                }
                matches.first().copied()
            }
        };

        let (Some(id), Some(version)) = (id, def.version) else {
            continue;
        };
        let Some(existing) = service.store().get_connector_version(id, version).await? else {
            continue;
        };
        if !existing.state.is_published() {
            continue;
        }
        // Unhashable definitions are already reported as invalid.
        let Ok(hash) = def.content_hash() else {
            continue;
        };

        if existing.hash != hash {
            violations.push(Violation::PublishedVersionImmutable { index, id, version });
        } else if def.state == Some(ConnectorVersionState::Draft) {
            violations.push(Violation::DraftOfPublished { index, id, version });
        }
    }

    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::definition;

    fn keys() -> Vec<String> {
        vec!["type".to_string()]
    }

    fn kinds(v: &Violations) -> Vec<&'static str> {
        v.iter()
            .map(|v| match v {
                Violation::InvalidDefinition { .. } => "invalid",
                Violation::MissingIdentity { .. } => "missing",
                Violation::DuplicateIdentity { .. } => "duplicate",
                Violation::InconsistentDifferentiation { .. } => "inconsistent",
                Violation::MultiplePrimary { .. } => "primary",
                Violation::AmbiguousLabels { .. } => "ambiguous",
                Violation::PublishedVersionImmutable { .. } => "immutable",
                Violation::DraftOfPublished { .. } => "draft",
                Violation::AmbiguousLabelMatch { .. } => "match",
            })
            .collect()
    }

    #[test]
    fn test_clean_batch() {
        let defs = vec![definition("a", "A"), definition("b", "B")];
        assert!(check_batch(&defs, &keys()).is_empty());
    }

    #[test]
    fn test_same_labels_without_version_clash() {
        let defs = vec![definition("fake", "A"), definition("fake", "B")];
        let v = check_batch(&defs, &keys());
        assert_eq!(kinds(&v), vec!["duplicate"]);
    }

    #[test]
    fn test_same_labels_distinct_versions_are_fine() {
        let mut a = definition("fake", "A");
        a.version = Some(1);
        a.state = Some(ConnectorVersionState::Active);
        let mut b = definition("fake", "B");
        b.version = Some(2);
        assert!(check_batch(&[a, b], &keys()).is_empty());
    }

    #[test]
    fn test_omitted_state_counts_as_primary() {
        let id = Uuid::new_v4();
        let mut a = definition("fake", "A");
        a.id = Some(id);
        a.version = Some(1);
        let mut b = a.clone();
        b.version = Some(2);
        let v = check_batch(&[a.clone(), b.clone()], &keys());
        assert_eq!(kinds(&v), vec!["primary"]);

        a.state = Some(ConnectorVersionState::Active);
        assert!(check_batch(&[a, b], &keys()).is_empty());
    }

    #[test]
    fn test_same_id_and_version_clash_regardless_of_state() {
        let id = Uuid::new_v4();
        let mut a = definition("fake", "A");
        a.id = Some(id);
        a.version = Some(1);
        a.state = Some(ConnectorVersionState::Active);
        let mut b = a.clone();
        b.state = Some(ConnectorVersionState::Primary);
        let v = check_batch(&[a, b], &keys());
        assert_eq!(kinds(&v), vec!["duplicate"]);
    }

    #[test]
    fn test_inconsistent_differentiation() {
        let id = Uuid::new_v4();
        let mut a = definition("fake", "A");
        a.id = Some(id);
        a.version = Some(1);
        let mut b = definition("fake", "B");
        b.id = Some(id);
        let v = check_batch(&[a, b], &keys());
        assert_eq!(kinds(&v), vec!["inconsistent"]);
    }

    #[test]
    fn test_multiple_primary() {
        let id = Uuid::new_v4();
        let mut a = definition("fake", "A");
        a.id = Some(id);
        a.version = Some(1);
        a.state = Some(ConnectorVersionState::Primary);
        let mut b = a.clone();
        b.version = Some(2);
        let v = check_batch(&[a, b], &keys());
        assert_eq!(kinds(&v), vec!["primary"]);
    }

    #[test]
    fn test_labels_shared_with_identified_definition() {
        let mut a = definition("fake", "A");
        a.id = Some(Uuid::new_v4());
        let b = definition("fake", "B");
        let v = check_batch(&[a, b], &keys());
        assert_eq!(kinds(&v), vec!["ambiguous"]);
    }

    #[test]
    fn test_collects_every_violation() {
        let no_identity = ConnectorDefinition::new("Nameless", Labels::new());
        let mut invalid = definition("x", "X");
        invalid.namespace = Some("nope".to_string());
        let dup_a = definition("fake", "A");
        let dup_b = definition("fake", "B");

        let v = check_batch(&[no_identity, invalid, dup_a, dup_b], &keys());
        assert_eq!(kinds(&v), vec!["missing", "invalid", "duplicate"]);
    }
}
