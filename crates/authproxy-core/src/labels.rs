// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Labels and label selectors.
//!
//! Labels are string key/value pairs attached to namespaces, connector versions
//! and connections. They are kept in a `BTreeMap` so their JSON form is
//! canonical (sorted keys), which the connector content hash relies on.
//!
//! Selector syntax is a comma separated list of requirements:
//!
//! | Term | Meaning |
//! |------|---------|
//! | `key=value` | label present with exactly this value |
//! | `key!=value` | label absent or with a different value |
//! | `key` | label present |
//! | `!key` | label absent |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Label set attached to an entity.
pub type Labels = BTreeMap<String, String>;

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9_./\-]{0,61}[A-Za-z0-9])?$").expect("valid label key regex")
});

static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9_.\-]{0,61}[A-Za-z0-9])?)?$")
        .expect("valid label value regex")
});

/// Validate a label key.
pub fn validate_key(key: &str) -> Result<()> {
    if KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(CoreError::validation(
            "labels",
            format!("invalid label key '{}'", key),
        ))
    }
}

/// Validate a label value.
pub fn validate_value(value: &str) -> Result<()> {
    if VALUE_RE.is_match(value) {
        Ok(())
    } else {
        Err(CoreError::validation(
            "labels",
            format!("invalid label value '{}'", value),
        ))
    }
}

/// Validate every key and value of a label set.
pub fn validate_labels(labels: &Labels) -> Result<()> {
    for (k, v) in labels {
        validate_key(k)?;
        validate_value(v)?;
    }
    Ok(())
}

/// Restrict a label set to the given keys.
pub fn subset(labels: &Labels, keys: &[String]) -> Labels {
    keys.iter()
        .filter_map(|k| labels.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

/// A single selector requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// `key=value`
    Equals(String, String),
    /// `key!=value`
    NotEquals(String, String),
    /// `key`
    Exists(String),
    /// `!key`
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::NotEquals(k, v) => labels.get(k) != Some(v),
            Self::Exists(k) => labels.contains_key(k),
            Self::NotExists(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(k, v) => write!(f, "{}={}", k, v),
            Self::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Self::Exists(k) => write!(f, "{}", k),
            Self::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector requiring every label of `labels` to match exactly.
    pub fn from_labels(labels: &Labels) -> Self {
        Self {
            requirements: labels
                .iter()
                .map(|(k, v)| Requirement::Equals(k.clone(), v.clone()))
                .collect(),
        }
    }

    /// The requirements of this selector, in declaration order.
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// True if this selector has no requirements (matches everything).
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Check whether a label set satisfies every requirement.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let mut requirements = Vec::new();

        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let requirement = if let Some((k, v)) = term.split_once("!=") {
                let (k, v) = (k.trim(), v.trim());
                validate_key(k)?;
                validate_value(v)?;
                Requirement::NotEquals(k.to_string(), v.to_string())
            } else if let Some((k, v)) = term.split_once('=') {
                let (k, v) = (k.trim(), v.trim().trim_start_matches('='));
                validate_key(k)?;
                validate_value(v)?;
                Requirement::Equals(k.to_string(), v.to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                let k = k.trim();
                validate_key(k)?;
                Requirement::NotExists(k.to_string())
            } else {
                validate_key(term)?;
                Requirement::Exists(term.to_string())
            };
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }
}

impl TryFrom<String> for LabelSelector {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LabelSelector> for String {
    fn from(selector: LabelSelector) -> Self {
        selector.to_string()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}
