//! Rule registry and alert rule data model
//!
//! Rules are validated on the way in and published to evaluators as
//! immutable snapshots.

pub mod model;
pub mod registry;

pub use model::{
    AggregationKind, Aggregation, AlertRule, Criteria, FailingPeriods, Granularity, Operator,
    QuerySemantics, Severity,
};
pub use registry::{RuleRegistry, RuleSnapshot};

use std::fmt;
use std::time::Duration;

/// A single violated rule constraint
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum RuleViolation {
    EmptyName,
    InvalidName(String),
    ZeroFrequency,
    FrequencyTooLarge(Duration),
    ZeroWindow,
    WindowTooLarge(Duration),
    ZeroBucket,
    NonFiniteThreshold(f64),
    ZeroEvaluationPeriods,
    ZeroFailingPeriods,
    FailingPeriodsExceedEvaluationPeriods {
        min_failing: u32,
        evaluation_periods: u32,
    },
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleViolation::EmptyName => write!(f, "name must not be empty"),
            RuleViolation::InvalidName(name) => write!(
                f,
                "name '{}' must start with an alphanumeric and contain only [A-Za-z0-9._:-]",
                name
            ),
            RuleViolation::ZeroFrequency => write!(f, "frequency must be greater than zero"),
            RuleViolation::FrequencyTooLarge(frequency) => write!(
                f,
                "frequency {:?} exceeds the maximum of {:?}",
                frequency,
                model::MAX_FREQUENCY
            ),
            RuleViolation::ZeroWindow => write!(f, "window must be greater than zero"),
            RuleViolation::WindowTooLarge(window) => write!(
                f,
                "window {:?} exceeds the maximum of {:?}",
                window,
                model::MAX_WINDOW
            ),
            RuleViolation::ZeroBucket => write!(f, "per-bucket aggregation needs a non-zero bucket"),
            RuleViolation::NonFiniteThreshold(value) => {
                write!(f, "threshold must be finite, got {}", value)
            }
            RuleViolation::ZeroEvaluationPeriods => {
                write!(f, "evaluation_periods must be at least 1")
            }
            RuleViolation::ZeroFailingPeriods => {
                write!(f, "min_failing_periods must be at least 1")
            }
            RuleViolation::FailingPeriodsExceedEvaluationPeriods {
                min_failing,
                evaluation_periods,
            } => write!(
                f,
                "min_failing_periods ({}) exceeds evaluation_periods ({})",
                min_failing, evaluation_periods
            ),
        }
    }
}

/// Rule rejected by the registry
#[derive(Debug, Clone, thiserror::Error)]
#[error("Invalid rule '{rule}': {}", format_violations(.violations))]
pub struct InvalidRuleError {
    pub rule: String,
    pub violations: Vec<RuleViolation>,
}

fn format_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
