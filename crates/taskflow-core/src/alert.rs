//! Alert rules and active alerts (spec §3, §4.5).

use crate::ids::{AlertRuleId, ActiveAlertId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    QueueLength,
    FailureRate,
    ProcessingTime,
    StuckJobs,
    WorkerDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: AlertRuleId,
    pub name: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    /// How long a condition must hold before triggering. Only `StuckJobs`
    /// interprets this as job age (minutes); other conditions treat it as
    /// advisory metadata carried on the rule (spec.md does not specify a
    /// duration semantics beyond stuck-job age).
    pub duration_minutes: u32,
    pub enabled: bool,
    pub recipients: Vec<String>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub cooldown_minutes: u32,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, condition: AlertCondition, threshold: f64) -> Self {
        Self {
            id: AlertRuleId::new(),
            name: name.into(),
            condition,
            threshold,
            duration_minutes: 0,
            enabled: true,
            recipients: Vec::new(),
            last_triggered: None,
            cooldown_minutes: 15,
        }
    }

    pub fn with_cooldown(mut self, minutes: u32) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }

    /// Whether this rule is still in its post-trigger cooldown window
    /// (spec §4.5, §8 invariant 8).
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered {
            Some(last) => now - last < chrono::Duration::minutes(self.cooldown_minutes as i64),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub id: ActiveAlertId,
    pub rule_id: AlertRuleId,
    pub message: String,
    pub severity: AlertSeverity,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged: Option<AckInfo>,
    pub resolved: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckInfo {
    pub at: DateTime<Utc>,
    pub by: String,
}

/// One log-shaped notification per recipient, fanned out on trigger
/// (spec §4.5). The concrete delivery mechanism (email, Slack, ...) is an
/// external collaborator; this crate only produces the fan-out record.
#[derive(Debug, Clone)]
pub struct AlertNotification {
    pub recipient: String,
    pub alert: ActiveAlert,
}
