// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hierarchical namespaces.
//!
//! A namespace path is a dot separated sequence rooted at the literal segment
//! `root` (`root`, `root.acme`, `root.acme.prod`). Every non-root namespace
//! requires its parent to exist; [`ensure_ancestor_path`] materializes the
//! whole prefix chain idempotently.
//!
//! Matchers select namespaces for listing: an exact path, or a path followed by
//! `.**` meaning "this namespace and all of its descendants".

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::labels::{Labels, validate_labels};
use crate::persistence::Persistence;

/// The root namespace every path descends from.
pub const ROOT_NAMESPACE: &str = "root";

/// Suffix that turns a path into a subtree matcher.
pub const DESCENDANTS_SUFFIX: &str = ".**";

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^root(\.[A-Za-z0-9_][A-Za-z0-9_\-]*)*$").expect("valid namespace regex")
});

/// Lifecycle state of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceState {
    /// Namespace is usable.
    Active,
}

impl NamespaceState {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
        }
    }
}

impl FromStr for NamespaceState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            other => Err(CoreError::validation(
                "namespace.state",
                format!("unknown namespace state '{}'", other),
            )),
        }
    }
}

/// A namespace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    /// Full dot separated path.
    pub path: String,
    /// Current state.
    pub state: NamespaceState,
    /// Labels attached to the namespace.
    pub labels: Labels,
    /// When the namespace was created.
    pub created_at: DateTime<Utc>,
    /// When the namespace was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Namespace {
    /// Create a new active namespace record stamped with the current time.
    pub fn new(path: impl Into<String>, labels: Labels) -> Self {
        let now = Utc::now();
        Self {
            path: path.into(),
            state: NamespaceState::Active,
            labels,
            created_at: now,
            updated_at: now,
        }
    }

    /// Path of the parent namespace, `None` for root.
    pub fn parent_path(&self) -> Option<&str> {
        parent_path(&self.path)
    }
}

/// Validate a concrete namespace path.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with(ROOT_NAMESPACE) {
        return Err(CoreError::InvalidNamespacePath {
            path: path.to_string(),
            reason: format!("must start with '{}'", ROOT_NAMESPACE),
        });
    }
    if !PATH_RE.is_match(path) {
        return Err(CoreError::InvalidNamespacePath {
            path: path.to_string(),
            reason: "segments must be alphanumeric, '_' or '-' and may not start with '-'"
                .to_string(),
        });
    }
    Ok(())
}

/// Validate a namespace matcher: a path optionally suffixed with `.**`.
pub fn validate_matcher(matcher: &str) -> Result<()> {
    match matcher.strip_suffix(DESCENDANTS_SUFFIX) {
        Some(prefix) => validate_path(prefix),
        None => validate_path(matcher),
    }
}

/// Path of the parent of `path`, `None` for a single-segment path.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind('.').map(|idx| &path[..idx])
}

/// The ordered prefix chain of a path: `root.a.b` → `[root, root.a, root.a.b]`.
pub fn prefix_chain(path: &str) -> Result<Vec<String>> {
    validate_path(path)?;

    let mut chain = Vec::new();
    let mut current = String::new();
    for segment in path.split('.') {
        if !current.is_empty() {
            current.push('.');
        }
        current.push_str(segment);
        chain.push(current.clone());
    }
    Ok(chain)
}

/// True iff `child` equals `parent` or lies beneath it.
pub fn is_same_or_child(parent: &str, child: &str) -> bool {
    child == parent
        || (child.len() > parent.len()
            && child.starts_with(parent)
            && child.as_bytes()[parent.len()] == b'.')
}

/// Selects either one namespace or a namespace subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NamespaceMatcher {
    /// Exactly this path.
    Exact(String),
    /// This path and all descendants.
    Subtree(String),
}

impl NamespaceMatcher {
    /// The path portion of the matcher (without the `.**` suffix).
    pub fn path(&self) -> &str {
        match self {
            Self::Exact(p) | Self::Subtree(p) => p,
        }
    }

    /// Check whether a namespace path is selected by this matcher.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => p == path,
            Self::Subtree(p) => is_same_or_child(p, path),
        }
    }
}

impl FromStr for NamespaceMatcher {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        validate_matcher(s)?;
        Ok(match s.strip_suffix(DESCENDANTS_SUFFIX) {
            Some(prefix) => Self::Subtree(prefix.to_string()),
            None => Self::Exact(s.to_string()),
        })
    }
}

impl TryFrom<String> for NamespaceMatcher {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NamespaceMatcher> for String {
    fn from(matcher: NamespaceMatcher) -> Self {
        matcher.to_string()
    }
}

impl fmt::Display for NamespaceMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => f.write_str(p),
            Self::Subtree(p) => write!(f, "{}{}", p, DESCENDANTS_SUFFIX),
        }
    }
}

/// Make sure every prefix of `path` exists, creating missing ones in order.
///
/// `labels` are applied to the leaf if it has to be created; intermediate
/// namespaces are created unlabeled. Returns the leaf namespace.
pub async fn ensure_ancestor_path(
    store: &dyn Persistence,
    path: &str,
    labels: &Labels,
) -> Result<Namespace> {
    validate_labels(labels)?;
    let chain = prefix_chain(path)?;

    let mut leaf = None;
    for (i, prefix) in chain.iter().enumerate() {
        let is_leaf = i + 1 == chain.len();

        if let Some(existing) = store.get_namespace(prefix).await? {
            leaf = Some(existing);
            continue;
        }

        let ns_labels = if is_leaf { labels.clone() } else { Labels::new() };
        let ns = Namespace::new(prefix.clone(), ns_labels);
        if store.create_namespace(&ns).await? {
            info!(namespace = %prefix, "Created namespace");
            leaf = Some(ns);
        } else {
            // Lost a creation race; the other writer's record is authoritative.
            debug!(namespace = %prefix, "Namespace created concurrently");
            leaf = store.get_namespace(prefix).await?;
        }
    }

    leaf.ok_or_else(|| CoreError::not_found("namespace", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("root").is_ok());
        assert!(validate_path("root.acme").is_ok());
        assert!(validate_path("root.acme_1.prod-eu").is_ok());
        assert!(validate_path("root._private").is_ok());

        assert!(validate_path("").is_err());
        assert!(validate_path("acme").is_err());
        assert!(validate_path("rootx").is_err());
        assert!(validate_path("root.").is_err());
        assert!(validate_path("root..a").is_err());
        assert!(validate_path("root.-a").is_err());
        assert!(validate_path("root.a b").is_err());
        assert!(validate_path("root.a.**").is_err());
    }

    #[test]
    fn test_validate_matcher() {
        assert!(validate_matcher("root").is_ok());
        assert!(validate_matcher("root.**").is_ok());
        assert!(validate_matcher("root.a.**").is_ok());

        assert!(validate_matcher("root.*").is_err());
        assert!(validate_matcher("root.a.*").is_err());
        assert!(validate_matcher("root.**.a").is_err());
        assert!(validate_matcher("root.a.***").is_err());
        assert!(validate_matcher("**").is_err());
    }

    #[test]
    fn test_prefix_chain() {
        assert_eq!(prefix_chain("root").unwrap(), vec!["root"]);
        assert_eq!(
            prefix_chain("root.a.b").unwrap(),
            vec!["root", "root.a", "root.a.b"]
        );
        assert!(matches!(
            prefix_chain("other.a"),
            Err(CoreError::InvalidNamespacePath { .. })
        ));
    }

    #[test]
    fn test_is_same_or_child() {
        assert!(is_same_or_child("root", "root"));
        assert!(is_same_or_child("root", "root.a"));
        assert!(is_same_or_child("root.a", "root.a.b.c"));
        assert!(!is_same_or_child("root.a", "root.ab"));
        assert!(!is_same_or_child("root.a", "root"));
        assert!(!is_same_or_child("root.a.b", "root.a"));
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("root"), None);
        assert_eq!(parent_path("root.a"), Some("root"));
        assert_eq!(parent_path("root.a.b"), Some("root.a"));
    }

    #[test]
    fn test_matcher_parse_and_match() {
        let exact: NamespaceMatcher = "root.a".parse().unwrap();
        assert!(exact.matches("root.a"));
        assert!(!exact.matches("root.a.b"));

        let subtree: NamespaceMatcher = "root.a.**".parse().unwrap();
        assert_eq!(subtree.path(), "root.a");
        assert!(subtree.matches("root.a"));
        assert!(subtree.matches("root.a.b"));
        assert!(!subtree.matches("root.ab"));
        assert_eq!(subtree.to_string(), "root.a.**");

        assert!("root.*".parse::<NamespaceMatcher>().is_err());
    }
}
