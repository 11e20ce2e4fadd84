//! Alert rules and alert instances.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NormalizeError;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    // ---
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = NormalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(NormalizeError::UnknownSeverity(other.to_string())),
        }
    }
}

/// Threshold configuration, keyed by rule type. Each variant carries only
/// what its evaluation reads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Breached when the newest Good value is `>= threshold`.
    ThresholdAbove { threshold: f64 },
    /// Breached when the newest Good value is `<= threshold`.
    ThresholdBelow { threshold: f64 },
    /// Breached when the change between the two newest Good readings is
    /// at least `max_change_per_minute` in either direction.
    RateOfChange { max_change_per_minute: f64 },
}

impl RuleCondition {
    // ---
    pub fn rule_type(&self) -> &'static str {
        // ---
        match self {
            RuleCondition::ThresholdAbove { .. } => "threshold_above",
            RuleCondition::ThresholdBelow { .. } => "threshold_below",
            RuleCondition::RateOfChange { .. } => "rate_of_change",
        }
    }
}

/// Operator-managed rule. Read-only to the evaluation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    // ---
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    pub severity: Severity,
    pub condition: RuleCondition,
    pub stream_ids: Vec<Uuid>,
    pub active: bool,
}

/// One rule's breach against one stream, from firing to clearing.
///
/// At most one instance per (rule, stream) has `cleared_at == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    // ---
    pub id: Uuid,
    pub rule_id: Uuid,
    pub stream_id: Uuid,
    pub severity: Severity,
    pub message: String,
    pub triggering_value: f64,
    pub threshold_value: f64,
    pub last_value: f64,
    pub last_seen_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

impl AlertInstance {
    // ---
    pub fn fire(
        rule: &AlertRule,
        stream_id: Uuid,
        value: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Self {
        // ---
        let verb = match rule.condition {
            RuleCondition::ThresholdAbove { .. } => "at or above",
            RuleCondition::ThresholdBelow { .. } => "at or below",
            RuleCondition::RateOfChange { .. } => "rate at or above",
        };

        AlertInstance {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            stream_id,
            severity: rule.severity,
            message: format!("{}: value {value} {verb} {threshold}", rule.name),
            triggering_value: value,
            threshold_value: threshold,
            last_value: value,
            last_seen_at: now,
            fired_at: now,
            cleared_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }
}
