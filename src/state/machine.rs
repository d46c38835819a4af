//! Failing-period state machine

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::NotificationEvent;
use crate::criteria::{EvaluationResult, Outcome};
use crate::rules::{AlertRule, FailingPeriods};

/// Lifecycle state of a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertState {
    /// No alert active
    #[default]
    Resolved,
    /// Some, but fewer than M, of the last N evaluations met the criteria
    Pending,
    /// At least M of the last N evaluations met the criteria
    Firing,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertState::Resolved => "resolved",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        };
        f.write_str(name)
    }
}

/// Fixed-capacity history of the most recent outcomes, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeHistory {
    capacity: usize,
    entries: VecDeque<Outcome>,
}

impl OutcomeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an outcome, evicting the oldest when full
    pub fn push(&mut self, outcome: Outcome) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(outcome);
    }

    /// Number of met outcomes among the most recent `n` entries
    pub fn met_in_last(&self, n: usize) -> usize {
        self.entries
            .iter()
            .rev()
            .take(n)
            .filter(|o| o.is_met())
            .count()
    }

    /// Change the capacity, keeping the most recent entries
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outcome> {
        self.entries.iter()
    }
}

/// Compute the next lifecycle state
///
/// Pure and total over its inputs. `auto_mitigate` only governs leaving
/// `Firing`; without it a firing rule stays firing until cleared.
pub fn next_state(
    history: &OutcomeHistory,
    policy: FailingPeriods,
    auto_mitigate: bool,
    current: AlertState,
) -> AlertState {
    let met = history.met_in_last(policy.evaluation_periods as usize);

    let target = if met >= policy.min_failing_periods as usize {
        AlertState::Firing
    } else if met > 0 {
        AlertState::Pending
    } else {
        AlertState::Resolved
    };

    match (current, target) {
        (AlertState::Firing, AlertState::Firing) => AlertState::Firing,
        (AlertState::Firing, _) if !auto_mitigate => AlertState::Firing,
        (_, target) => target,
    }
}

/// Mutable per-rule evaluation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleState {
    pub history: OutcomeHistory,
    pub state: AlertState,
    pub last_transition: Option<DateTime<Utc>>,
    /// Last state a notification was dispatched for
    pub last_notified: Option<AlertState>,
    /// Number of transitions so far; identifies each transition
    pub transitions: u64,
    pub last_evaluated: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
    pub last_value: Option<f64>,
}

impl RuleState {
    pub fn new(evaluation_periods: u32) -> Self {
        Self {
            history: OutcomeHistory::new(evaluation_periods as usize),
            state: AlertState::Resolved,
            last_transition: None,
            last_notified: None,
            transitions: 0,
            last_evaluated: None,
            last_outcome: None,
            last_value: None,
        }
    }

    /// Re-fit the history to the rule's current evaluation period count
    pub fn fit(&mut self, rule: &AlertRule) {
        let periods = rule.failing_periods.evaluation_periods as usize;
        if self.history.capacity() != periods {
            self.history.resize(periods);
        }
    }

    /// Record one evaluation and return the notification for any transition
    ///
    /// Indeterminate outcomes take a history slot but never move the state
    /// on the tick that produced them.
    pub fn apply(
        &mut self,
        rule: &AlertRule,
        result: &EvaluationResult,
    ) -> Option<NotificationEvent> {
        self.fit(rule);
        self.history.push(result.outcome);
        self.last_evaluated = Some(result.timestamp);
        self.last_outcome = Some(result.outcome);
        if result.value.is_some() {
            self.last_value = result.value;
        }

        if result.outcome.is_indeterminate() {
            return None;
        }

        let next = next_state(
            &self.history,
            rule.failing_periods,
            rule.auto_mitigate,
            self.state,
        );
        self.transition_to(rule, next, result.timestamp, &result.detail)
    }

    /// Operator action: forget the history and resolve the rule
    pub fn clear(&mut self, rule: &AlertRule, at: DateTime<Utc>) -> Option<NotificationEvent> {
        self.history.clear();
        self.transition_to(rule, AlertState::Resolved, at, "cleared by operator")
    }

    /// Remember that a notification for `state` was dispatched
    pub fn mark_notified(&mut self, state: AlertState) {
        self.last_notified = Some(state);
    }

    fn transition_to(
        &mut self,
        rule: &AlertRule,
        next: AlertState,
        at: DateTime<Utc>,
        detail: &str,
    ) -> Option<NotificationEvent> {
        if next == self.state {
            return None;
        }

        let previous = self.state;
        self.state = next;
        self.last_transition = Some(at);
        self.transitions += 1;

        let met = self
            .history
            .met_in_last(rule.failing_periods.evaluation_periods as usize);

        Some(NotificationEvent::new(
            rule,
            previous,
            next,
            at,
            self.transitions,
            self.last_value,
            format!(
                "{} of the last {} evaluations met the criteria (alert at {}); {}",
                met,
                rule.failing_periods.evaluation_periods,
                rule.failing_periods.min_failing_periods,
                detail
            ),
        ))
    }
}
