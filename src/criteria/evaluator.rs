//! Criteria evaluation against query results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregation::{accumulate_buckets, aggregate};
use crate::rules::{Aggregation, Criteria, Granularity, Operator, QuerySemantics};
use crate::telemetry::{AggregateResult, TelemetryQueryError};

/// Result of one evaluation tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Met,
    NotMet,
    /// The telemetry query failed; neither met nor not met
    Indeterminate,
}

impl Outcome {
    pub fn is_met(&self) -> bool {
        matches!(self, Outcome::Met)
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Outcome::Indeterminate)
    }

    fn from_bool(met: bool) -> Self {
        if met {
            Outcome::Met
        } else {
            Outcome::NotMet
        }
    }
}

/// Outcome plus the value it was decided on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub outcome: Outcome,
    /// Value compared against the threshold, if any
    pub value: Option<f64>,
    /// Human-readable explanation
    pub detail: String,
}

impl Evaluation {
    fn compared(value: f64, operator: Operator, threshold: f64, label: &str) -> Self {
        let met = operator.compare(value, threshold);
        let detail = format!(
            "{} = {} ({} {} {})",
            label,
            value,
            if met { "meets" } else { "does not meet" },
            operator.symbol(),
            threshold
        );
        Self {
            outcome: Outcome::from_bool(met),
            value: Some(value),
            detail,
        }
    }
}

/// Produced every tick for a rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub rule: String,
    pub timestamp: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub value: Option<f64>,
    pub outcome: Outcome,
    pub detail: String,
    /// Telemetry attempts made, including retries
    pub attempts: u32,
}

/// Score a query result against a rule's criteria
///
/// A failed query always yields [`Outcome::Indeterminate`].
pub fn evaluate(
    criteria: &Criteria,
    window_start: DateTime<Utc>,
    query: &Result<AggregateResult, TelemetryQueryError>,
) -> Evaluation {
    let result = match query {
        Ok(result) => result,
        Err(e) => {
            return Evaluation {
                outcome: Outcome::Indeterminate,
                value: None,
                detail: format!("telemetry query failed: {}", e),
            }
        }
    };

    match criteria {
        Criteria::StaticThreshold {
            metric,
            operator,
            threshold,
            aggregation,
        } => evaluate_static(metric, *operator, *threshold, *aggregation, window_start, result),
        Criteria::QueryThreshold {
            operator,
            threshold,
            semantics,
            ..
        } => evaluate_query(*operator, *threshold, *semantics, result),
    }
}

fn evaluate_static(
    metric: &str,
    operator: Operator,
    threshold: f64,
    aggregation: Aggregation,
    window_start: DateTime<Utc>,
    result: &AggregateResult,
) -> Evaluation {
    let label = format!("{:?}({})", aggregation.kind, metric);

    match aggregation.granularity {
        Granularity::Window => match aggregate(aggregation.kind, &result.values()) {
            Some(value) => Evaluation::compared(value, operator, threshold, &label),
            None => Evaluation {
                outcome: Outcome::NotMet,
                value: None,
                detail: format!("{}: no data in window", label),
            },
        },
        Granularity::PerBucket { bucket } => {
            let groups = accumulate_buckets(result, window_start, bucket);
            let mut last = None;

            for (start, acc) in &groups {
                let Some(value) = acc.result(aggregation.kind) else {
                    continue;
                };
                if operator.compare(value, threshold) {
                    let mut evaluation = Evaluation::compared(value, operator, threshold, &label);
                    evaluation.detail = format!("{} in bucket starting {}", evaluation.detail, start);
                    return evaluation;
                }
                last = Some(value);
            }

            match last {
                Some(value) => {
                    let mut evaluation = Evaluation::compared(value, operator, threshold, &label);
                    evaluation.detail = format!(
                        "no bucket of {} meets the threshold; latest {}",
                        groups.len(),
                        evaluation.detail
                    );
                    evaluation
                }
                None => Evaluation {
                    outcome: Outcome::NotMet,
                    value: None,
                    detail: format!("{}: no data in window", label),
                },
            }
        }
    }
}

fn evaluate_query(
    operator: Operator,
    threshold: f64,
    semantics: QuerySemantics,
    result: &AggregateResult,
) -> Evaluation {
    match semantics {
        QuerySemantics::AnyBucket => {
            let qualifying = match result {
                AggregateResult::Scalar(count) => *count,
                AggregateResult::Buckets(buckets) => {
                    buckets.iter().filter(|b| b.value > 0.0).count() as f64
                }
            };
            let met = qualifying > 0.0;
            Evaluation {
                outcome: Outcome::from_bool(met),
                value: Some(qualifying),
                detail: format!("{} qualifying bucket(s) in window", qualifying),
            }
        }
        QuerySemantics::Aggregate => {
            let value = match result {
                AggregateResult::Scalar(value) => *value,
                AggregateResult::Buckets(buckets) => buckets.iter().map(|b| b.value).sum(),
            };
            Evaluation::compared(value, operator, threshold, "query result")
        }
    }
}
