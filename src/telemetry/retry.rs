//! Bounded retries for telemetry queries

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::{AggregateResult, QueryDescriptor, TelemetryClient, TelemetryQueryError};

/// Retry and timeout settings for one evaluation's query
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt
    pub fn no_retry(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout,
            ..Default::default()
        }
    }

    /// Exponential delay before retry number `attempt` (1-based), with jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}

/// Run a query, retrying transient failures with backoff
///
/// Returns the result together with the number of attempts made.
pub async fn query_with_retry(
    client: &dyn TelemetryClient,
    policy: &RetryPolicy,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    descriptor: &QueryDescriptor,
) -> (Result<AggregateResult, TelemetryQueryError>, u32) {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(
            policy.attempt_timeout,
            client.query(window_start, window_end, descriptor),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TelemetryQueryError::Timeout(policy.attempt_timeout)),
        };

        match result {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    query = %descriptor.text(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Telemetry query failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
