//! Window aggregation functions

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::rules::AggregationKind;
use crate::telemetry::{AggregateResult, Bucket};

/// Running statistics over a series of samples
///
/// One pass produces every aggregation kind; NaN samples are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowAccumulator {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl WindowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Final value for `kind`; `None` when the kind is undefined on no data
    pub fn result(&self, kind: AggregationKind) -> Option<f64> {
        match kind {
            AggregationKind::Count => Some(self.count as f64),
            AggregationKind::Sum => Some(self.sum),
            AggregationKind::Avg => {
                if self.count == 0 {
                    None
                } else {
                    Some(self.sum / self.count as f64)
                }
            }
            AggregationKind::Min => self.min,
            AggregationKind::Max => self.max,
        }
    }
}

impl FromIterator<f64> for WindowAccumulator {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = WindowAccumulator::new();
        for value in iter {
            acc.accumulate(value);
        }
        acc
    }
}

/// Aggregate a series of samples
pub fn aggregate(kind: AggregationKind, values: &[f64]) -> Option<f64> {
    values
        .iter()
        .copied()
        .collect::<WindowAccumulator>()
        .result(kind)
}

/// Group samples into fixed buckets aligned to `window_start`, oldest first
///
/// A scalar result forms a single bucket. Samples stamped before the window
/// start fall into the first bucket.
pub fn accumulate_buckets(
    result: &AggregateResult,
    window_start: DateTime<Utc>,
    bucket: Duration,
) -> Vec<(DateTime<Utc>, WindowAccumulator)> {
    let samples: &[Bucket] = match result {
        AggregateResult::Scalar(value) => {
            let mut acc = WindowAccumulator::new();
            acc.accumulate(*value);
            return vec![(window_start, acc)];
        }
        AggregateResult::Buckets(samples) => samples,
    };

    let bucket_ms = (bucket.as_millis() as i64).max(1);
    let origin = window_start.timestamp_millis();
    let mut groups: BTreeMap<i64, WindowAccumulator> = BTreeMap::new();

    for sample in samples {
        let offset = (sample.start.timestamp_millis() - origin).max(0);
        groups
            .entry(offset / bucket_ms)
            .or_default()
            .accumulate(sample.value);
    }

    groups
        .into_iter()
        .map(|(index, acc)| {
            let start = window_start + chrono::Duration::milliseconds(index * bucket_ms);
            (start, acc)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_kinds() {
        let values = [4.0, 1.0, 7.0];
        assert_eq!(aggregate(AggregationKind::Sum, &values), Some(12.0));
        assert_eq!(aggregate(AggregationKind::Avg, &values), Some(4.0));
        assert_eq!(aggregate(AggregationKind::Min, &values), Some(1.0));
        assert_eq!(aggregate(AggregationKind::Max, &values), Some(7.0));
        assert_eq!(aggregate(AggregationKind::Count, &values), Some(3.0));
    }

    #[test]
    fn test_aggregate_empty_series() {
        assert_eq!(aggregate(AggregationKind::Sum, &[]), Some(0.0));
        assert_eq!(aggregate(AggregationKind::Count, &[]), Some(0.0));
        assert_eq!(aggregate(AggregationKind::Avg, &[]), None);
        assert_eq!(aggregate(AggregationKind::Min, &[]), None);
        assert_eq!(aggregate(AggregationKind::Max, &[]), None);
    }

    #[test]
    fn test_nan_samples_are_skipped() {
        let values = [2.0, f64::NAN, 4.0];
        assert_eq!(aggregate(AggregationKind::Avg, &values), Some(3.0));
        assert_eq!(aggregate(AggregationKind::Count, &values), Some(2.0));

        let acc: WindowAccumulator = values.into_iter().collect();
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.result(AggregationKind::Max), Some(4.0));
    }

    #[test]
    fn test_accumulate_buckets_groups_by_offset() {
        let start = Utc::now();
        let sample = |secs: i64, value: f64| Bucket {
            start: start + chrono::Duration::seconds(secs),
            value,
        };
        let result = AggregateResult::Buckets(vec![
            sample(0, 1.0),
            sample(30, 3.0),
            sample(60, 10.0),
            sample(150, 4.0),
        ]);

        let groups = accumulate_buckets(&result, start, Duration::from_secs(60));
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].1.result(AggregationKind::Sum), Some(4.0));
        assert_eq!(groups[1].1.result(AggregationKind::Max), Some(10.0));
        assert_eq!(groups[2].0, start + chrono::Duration::seconds(120));
    }

    #[test]
    fn test_accumulate_buckets_scalar() {
        let start = Utc::now();
        let groups =
            accumulate_buckets(&AggregateResult::Scalar(5.0), start, Duration::from_secs(60));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.result(AggregationKind::Avg), Some(5.0));
    }
}
