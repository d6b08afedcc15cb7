// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector probes.
//!
//! Probes are health checks declared in a connector definition. They are
//! never persisted on their own: a [`Probe`] is derived from its
//! [`ProbeDefinition`] whenever a connection needs it.
//!
//! A probe is periodic when it declares a fixed `period` (any `humantime`
//! duration such as `15m`) or a `cron` expression. The schedule string used by
//! the task scheduler is `@every <duration>` for periods and the literal cron
//! expression otherwise.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Prefix of fixed-period schedule strings.
pub const EVERY_PREFIX: &str = "@every ";

/// Probe as declared in a connector definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDefinition {
    /// Probe id, unique within the connector.
    pub id: String,
    /// Fixed period, e.g. `30s` or `1h 30m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    /// Cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// HTTP request to issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProbeRequest>,
}

impl ProbeDefinition {
    /// Validate the probe declaration.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::validation("probes.id", "probe id is required"));
        }
        Probe::try_from(self).map(|_| ())
    }
}

/// HTTP request issued by a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProbeRequest {
    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Send through the connection's proxy, applying the connector's auth.
    #[serde(default)]
    pub via_proxy: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

/// When a probe runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSchedule {
    /// Every fixed duration.
    Period(Duration),
    /// On a cron expression.
    Cron(String),
    /// Only on demand.
    None,
}

impl ProbeSchedule {
    /// Parse a schedule string: `@every <duration>` or a cron expression.
    pub fn parse(schedule: &str) -> Result<Self> {
        let schedule = schedule.trim();
        if let Some(period) = schedule.strip_prefix(EVERY_PREFIX) {
            return parse_period(period).map(Self::Period);
        }
        parse_firing_cron(schedule)?;
        Ok(Self::Cron(schedule.to_string()))
    }

    /// Whether the probe runs on a schedule.
    pub fn is_periodic(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// The schedule string, `None` for on-demand probes.
    pub fn schedule_string(&self) -> Option<String> {
        match self {
            Self::Period(d) => Some(format!(
                "{}{}",
                EVERY_PREFIX,
                humantime::format_duration(*d)
            )),
            Self::Cron(expr) => Some(expr.clone()),
            Self::None => None,
        }
    }

    /// Next fire time strictly after `after`.
    ///
    /// Periods are aligned to multiples of the period since the Unix epoch,
    /// so every scheduler computes the same occurrences.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Period(d) => {
                let step = i64::try_from(d.as_millis())
                    .map_err(|e| CoreError::validation("period", e.to_string()))?
                    .max(1);
                let next = (after.timestamp_millis().div_euclid(step) + 1)
                    .checked_mul(step)
                    .and_then(DateTime::from_timestamp_millis);
                Ok(next)
            }
            Self::Cron(expr) => {
                let cron = parse_cron(expr)?;
                cron.find_next_occurrence(&after, false)
                    .map(Some)
                    .map_err(|e| CoreError::validation("cron", e.to_string()))
            }
            Self::None => Ok(None),
        }
    }
}

fn parse_period(period: &str) -> Result<Duration> {
    let d = humantime::parse_duration(period.trim())
        .map_err(|e| CoreError::validation("period", format!("'{}': {}", period, e)))?;
    if d.is_zero() {
        return Err(CoreError::validation("period", "period must be positive"));
    }
    Ok(d)
}

fn parse_cron(expr: &str) -> Result<Cron> {
    Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| CoreError::validation("cron", format!("'{}': {}", expr, e)))
}

/// Parse a cron expression that fires at least once from now on.
fn parse_firing_cron(expr: &str) -> Result<Cron> {
    let cron = parse_cron(expr)?;
    cron.find_next_occurrence(&Utc::now(), false)
        .map_err(|e| CoreError::validation("cron", format!("'{}' never fires: {}", expr, e)))?;
    Ok(cron)
}

/// How a probe is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeInvocation {
    /// Raw HTTP request without credentials.
    HttpDirect(HttpProbeRequest),
    /// HTTP request through the connection proxy with connector auth applied.
    HttpViaProxy(HttpProbeRequest),
    /// Probe kind without an executor; invocation is a no-op.
    Passthrough,
}

/// A probe resolved from its definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Probe id.
    pub id: String,
    /// Schedule.
    pub schedule: ProbeSchedule,
    /// Invocation kind.
    pub invocation: ProbeInvocation,
}

impl Probe {
    /// Whether the probe runs on a schedule.
    pub fn is_periodic(&self) -> bool {
        self.schedule.is_periodic()
    }
}

impl TryFrom<&ProbeDefinition> for Probe {
    type Error = CoreError;

    fn try_from(def: &ProbeDefinition) -> Result<Self> {
        let schedule = match (&def.period, &def.cron) {
            (Some(_), Some(_)) => {
                return Err(CoreError::validation(
                    "probes",
                    format!("probe '{}' declares both period and cron", def.id),
                ));
            }
            (Some(period), None) => ProbeSchedule::Period(parse_period(period)?),
            (None, Some(expr)) => {
                parse_firing_cron(expr)?;
                ProbeSchedule::Cron(expr.clone())
            }
            (None, None) => ProbeSchedule::None,
        };

        let invocation = match &def.http {
            Some(http) => {
                let method = http.method.to_ascii_uppercase();
                if reqwest::Method::from_bytes(method.as_bytes()).is_err() {
                    return Err(CoreError::validation(
                        "probes.http.method",
                        format!("invalid method '{}'", http.method),
                    ));
                }
                if reqwest::Url::parse(&http.url).is_err() {
                    return Err(CoreError::validation(
                        "probes.http.url",
                        format!("invalid url '{}'", http.url),
                    ));
                }
                let mut http = http.clone();
                http.method = method;
                if http.via_proxy {
                    ProbeInvocation::HttpViaProxy(http)
                } else {
                    ProbeInvocation::HttpDirect(http)
                }
            }
            None => ProbeInvocation::Passthrough,
        };

        Ok(Self {
            id: def.id.clone(),
            schedule,
            invocation,
        })
    }
}

/// Result classification of one probe invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// 2xx response.
    Success,
    /// 4xx/5xx response or transport failure.
    Error,
    /// Not determinable.
    Unknown,
}

impl ProbeOutcome {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            400..=599 => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for ProbeOutcome {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            other => Err(CoreError::validation(
                "outcome",
                format!("unknown probe outcome '{}'", other),
            )),
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded result of one probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcomeRecord {
    /// Connection probed.
    pub connection_id: Uuid,
    /// Probe id.
    pub probe_id: String,
    /// Outcome.
    pub outcome: ProbeOutcome,
    /// HTTP status, when a response was received.
    pub status_code: Option<u16>,
    /// Error message for transport failures.
    pub error: Option<String>,
    /// Wall-clock duration of the invocation.
    pub duration_ms: u64,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
}

/// One periodic probe of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTask {
    /// Connection the probe runs against.
    pub connection_id: Uuid,
    /// Probe id.
    pub probe_id: String,
    /// `@every <duration>` or a cron expression.
    pub schedule: String,
}

impl CronTask {
    /// Stable key of the periodic entry.
    pub fn key(&self) -> String {
        format!("{}/{}", self.connection_id, self.probe_id)
    }
}
