//! Alert rule definitions

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{InvalidRuleError, RuleViolation};
use crate::telemetry::QueryDescriptor;

/// Longest accepted evaluation frequency
pub const MAX_FREQUENCY: Duration = Duration::from_secs(24 * 60 * 60);
/// Longest accepted evaluation window
pub const MAX_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Alert rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule name
    pub name: String,
    /// Free text carried into notifications
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    /// How often the rule is evaluated
    #[serde(with = "duration_serde")]
    pub frequency: Duration,
    /// Span of telemetry considered by one evaluation
    #[serde(with = "duration_serde")]
    pub window: Duration,
    pub criteria: Criteria,
    #[serde(default)]
    pub failing_periods: FailingPeriods,
    /// Return to Resolved automatically once the condition clears
    #[serde(default = "default_true")]
    pub auto_mitigate: bool,
    /// Target notification channel IDs
    #[serde(default)]
    pub channels: BTreeSet<String>,
    /// Disabled rules stay registered but are never scheduled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AlertRule {
    /// Create a rule with a one minute frequency and a five minute window
    pub fn new(name: impl Into<String>, criteria: Criteria) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            severity: Severity::Warning,
            frequency: Duration::from_secs(60),
            window: Duration::from_secs(300),
            criteria,
            failing_periods: FailingPeriods::default(),
            auto_mitigate: true,
            channels: BTreeSet::new(),
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Alert once `min_failing` of the last `evaluation_periods` evaluations met the criteria
    pub fn with_failing_periods(mut self, evaluation_periods: u32, min_failing: u32) -> Self {
        self.failing_periods = FailingPeriods {
            evaluation_periods,
            min_failing_periods: min_failing,
        };
        self
    }

    pub fn with_auto_mitigate(mut self, auto_mitigate: bool) -> Self {
        self.auto_mitigate = auto_mitigate;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.insert(channel.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check every rule invariant, collecting all violations
    pub fn validate(&self) -> Result<(), InvalidRuleError> {
        let mut violations = Vec::new();

        if self.name.trim().is_empty() {
            violations.push(RuleViolation::EmptyName);
        } else if !name_pattern().is_match(&self.name) {
            violations.push(RuleViolation::InvalidName(self.name.clone()));
        }

        if self.frequency.is_zero() {
            violations.push(RuleViolation::ZeroFrequency);
        } else if self.frequency > MAX_FREQUENCY {
            violations.push(RuleViolation::FrequencyTooLarge(self.frequency));
        }
        if self.window.is_zero() {
            violations.push(RuleViolation::ZeroWindow);
        } else if self.window > MAX_WINDOW {
            violations.push(RuleViolation::WindowTooLarge(self.window));
        }

        if let Criteria::StaticThreshold {
            aggregation:
                Aggregation {
                    granularity: Granularity::PerBucket { bucket },
                    ..
                },
            ..
        } = &self.criteria
        {
            if bucket.is_zero() {
                violations.push(RuleViolation::ZeroBucket);
            }
        }

        let threshold = self.criteria.threshold();
        if !threshold.is_finite() {
            violations.push(RuleViolation::NonFiniteThreshold(threshold));
        }

        let FailingPeriods {
            evaluation_periods,
            min_failing_periods,
        } = self.failing_periods;
        if evaluation_periods == 0 {
            violations.push(RuleViolation::ZeroEvaluationPeriods);
        }
        if min_failing_periods == 0 {
            violations.push(RuleViolation::ZeroFailingPeriods);
        }
        if min_failing_periods > evaluation_periods {
            violations.push(RuleViolation::FailingPeriodsExceedEvaluationPeriods {
                min_failing: min_failing_periods,
                evaluation_periods,
            });
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(InvalidRuleError {
                rule: self.name.clone(),
                violations,
            })
        }
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").expect("rule name pattern is valid")
    })
}

/// Alert severity, ordered so that `Critical` is the greatest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Verbose,
    Informational,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Numeric level where 0 is the most severe
    pub fn level(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::Error => 1,
            Severity::Warning => 2,
            Severity::Informational => 3,
            Severity::Verbose => 4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Informational => "informational",
            Severity::Verbose => "verbose",
        };
        f.write_str(name)
    }
}

/// Comparison applied between an observed value and a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
}

impl Operator {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::GreaterThan => value > threshold,
            Operator::GreaterThanOrEqual => value >= threshold,
            Operator::LessThan => value < threshold,
            Operator::LessThanOrEqual => value <= threshold,
            Operator::Equal => value == threshold,
            Operator::NotEqual => value != threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
        }
    }
}

/// Function used to reduce a series of samples to one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationKind {
    Sum,
    Avg,
    Max,
    Min,
    Count,
}

/// Whether a static threshold is compared once per window or once per bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    /// Reduce the whole window to one value and compare it
    #[default]
    Window,
    /// Split the window into buckets of this length, reduce each and
    /// compare; met if any bucket satisfies the comparison
    PerBucket {
        #[serde(with = "duration_serde")]
        bucket: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub kind: AggregationKind,
    #[serde(default)]
    pub granularity: Granularity,
}

impl Aggregation {
    pub fn window(kind: AggregationKind) -> Self {
        Self {
            kind,
            granularity: Granularity::Window,
        }
    }

    pub fn per_bucket(kind: AggregationKind, bucket: Duration) -> Self {
        Self {
            kind,
            granularity: Granularity::PerBucket { bucket },
        }
    }
}

/// How the number returned for a query threshold is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySemantics {
    /// The query yields qualifying buckets; met iff at least one exists
    #[default]
    AnyBucket,
    /// The query yields an aggregate compared with operator and threshold
    Aggregate,
}

/// Condition evaluated each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Criteria {
    StaticThreshold {
        metric: String,
        operator: Operator,
        threshold: f64,
        aggregation: Aggregation,
    },
    QueryThreshold {
        query: String,
        operator: Operator,
        threshold: f64,
        #[serde(default)]
        semantics: QuerySemantics,
    },
}

impl Criteria {
    pub fn static_threshold(
        metric: impl Into<String>,
        operator: Operator,
        threshold: f64,
        aggregation: Aggregation,
    ) -> Self {
        Criteria::StaticThreshold {
            metric: metric.into(),
            operator,
            threshold,
            aggregation,
        }
    }

    pub fn query_threshold(
        query: impl Into<String>,
        operator: Operator,
        threshold: f64,
        semantics: QuerySemantics,
    ) -> Self {
        Criteria::QueryThreshold {
            query: query.into(),
            operator,
            threshold,
            semantics,
        }
    }

    pub fn threshold(&self) -> f64 {
        match self {
            Criteria::StaticThreshold { threshold, .. }
            | Criteria::QueryThreshold { threshold, .. } => *threshold,
        }
    }

    pub fn operator(&self) -> Operator {
        match self {
            Criteria::StaticThreshold { operator, .. }
            | Criteria::QueryThreshold { operator, .. } => *operator,
        }
    }

    /// Descriptor handed to the telemetry backend
    pub fn descriptor(&self) -> QueryDescriptor {
        match self {
            Criteria::StaticThreshold { metric, .. } => QueryDescriptor::metric(metric),
            Criteria::QueryThreshold { query, .. } => QueryDescriptor::query(query),
        }
    }
}

/// N-of-M failing period policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingPeriods {
    /// Length N of the sliding history
    pub evaluation_periods: u32,
    /// Number M of met outcomes within the history that fires the alert
    pub min_failing_periods: u32,
}

impl Default for FailingPeriods {
    fn default() -> Self {
        Self {
            evaluation_periods: 1,
            min_failing_periods: 1,
        }
    }
}

/// Duration serialization helper
mod duration_serde {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    const NANOS_PER_SEC: u32 = 1_000_000_000;

    #[derive(Serialize, Deserialize)]
    struct DurationHelper {
        secs: u64,
        #[serde(default)]
        nanos: u32,
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        DurationHelper {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper = DurationHelper::deserialize(deserializer)?;
        if helper.nanos >= NANOS_PER_SEC {
            return Err(D::Error::custom(format!(
                "nanos must be below {}, got {}",
                NANOS_PER_SEC, helper.nanos
            )));
        }
        Ok(Duration::new(helper.secs, helper.nanos))
    }
}
