//! Notification events emitted on state transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::machine::AlertState;
use crate::rules::{AlertRule, Severity};

/// A rule changed lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub rule: String,
    pub previous: AlertState,
    pub state: AlertState,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    /// Per-rule transition counter; unique for each transition of a rule
    pub sequence: u64,
    /// Latest observed value, if any
    pub value: Option<f64>,
    pub description: String,
}

impl NotificationEvent {
    pub(crate) fn new(
        rule: &AlertRule,
        previous: AlertState,
        state: AlertState,
        timestamp: DateTime<Utc>,
        sequence: u64,
        value: Option<f64>,
        detail: String,
    ) -> Self {
        let description = if rule.description.is_empty() {
            format!("Alert '{}' is {}: {}", rule.name, state, detail)
        } else {
            format!(
                "Alert '{}' is {}: {}. {}",
                rule.name, state, detail, rule.description
            )
        };

        Self {
            rule: rule.name.clone(),
            previous,
            state,
            severity: rule.severity,
            timestamp,
            sequence,
            value,
            description,
        }
    }

    /// Short one-line summary used as a subject line
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} {} -> {}",
            self.severity, self.rule, self.previous, self.state
        )
    }
}
