//! Telemetry backend interface
//!
//! The engine never interprets query text. It hands an opaque descriptor and
//! a time window to a [`TelemetryClient`] and reads back numbers.

pub mod http;
pub mod retry;

pub use http::HttpTelemetryClient;
pub use retry::{query_with_retry, RetryPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque query handed to the telemetry backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum QueryDescriptor {
    /// A metric name; the backend returns its raw series for the window
    Metric(String),
    /// A structured query string; the backend returns its result
    Query(String),
}

impl QueryDescriptor {
    pub fn metric(name: impl Into<String>) -> Self {
        QueryDescriptor::Metric(name.into())
    }

    pub fn query(text: impl Into<String>) -> Self {
        QueryDescriptor::Query(text.into())
    }

    pub fn text(&self) -> &str {
        match self {
            QueryDescriptor::Metric(text) | QueryDescriptor::Query(text) => text,
        }
    }
}

/// One time bucket of a windowed series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub value: f64,
}

/// Result of a windowed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateResult {
    /// A single aggregate value for the whole window
    Scalar(f64),
    /// Per-bucket values, oldest first
    Buckets(Vec<Bucket>),
}

impl AggregateResult {
    /// Raw values in bucket order
    pub fn values(&self) -> Vec<f64> {
        match self {
            AggregateResult::Scalar(v) => vec![*v],
            AggregateResult::Buckets(buckets) => buckets.iter().map(|b| b.value).collect(),
        }
    }
}

/// Executes windowed aggregate queries
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    async fn query(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        descriptor: &QueryDescriptor,
    ) -> Result<AggregateResult, TelemetryQueryError>;
}

/// Telemetry query failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum TelemetryQueryError {
    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned status {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Malformed query result: {0}")]
    Decode(String),
}

impl TelemetryQueryError {
    /// Whether retrying the same query may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TelemetryQueryError::Timeout(_) | TelemetryQueryError::Transport(_) => true,
            TelemetryQueryError::Backend { status, .. } => *status >= 500 || *status == 429,
            TelemetryQueryError::Decode(_) => false,
        }
    }
}
