//! HTTP telemetry adapter

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{AggregateResult, Bucket, QueryDescriptor, TelemetryClient, TelemetryQueryError};

/// Telemetry client that POSTs windowed queries to `<base_url>/query`
#[derive(Debug, Clone)]
pub struct HttpTelemetryClient {
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct WindowedQueryRequest<'a> {
    #[serde(flatten)]
    descriptor: &'a QueryDescriptor,
    window_start: i64,
    window_end: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WindowedQueryResponse {
    Scalar { value: f64 },
    Buckets { buckets: Vec<BucketResponse> },
}

#[derive(Debug, Deserialize)]
struct BucketResponse {
    /// Bucket start, unix millis
    start: i64,
    value: f64,
}

impl HttpTelemetryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TelemetryQueryError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryQueryError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TelemetryClient for HttpTelemetryClient {
    async fn query(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        descriptor: &QueryDescriptor,
    ) -> Result<AggregateResult, TelemetryQueryError> {
        let url = format!("{}/query", self.base_url);
        let request = WindowedQueryRequest {
            descriptor,
            window_start: window_start.timestamp_millis(),
            window_end: window_end.timestamp_millis(),
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TelemetryQueryError::Timeout(self.timeout)
                } else {
                    TelemetryQueryError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TelemetryQueryError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        let body: WindowedQueryResponse = response
            .json()
            .await
            .map_err(|e| TelemetryQueryError::Decode(e.to_string()))?;

        match body {
            WindowedQueryResponse::Scalar { value } => Ok(AggregateResult::Scalar(value)),
            WindowedQueryResponse::Buckets { buckets } => buckets
                .into_iter()
                .map(|b| {
                    Utc.timestamp_millis_opt(b.start)
                        .single()
                        .map(|start| Bucket {
                            start,
                            value: b.value,
                        })
                        .ok_or_else(|| {
                            TelemetryQueryError::Decode(format!(
                                "bucket start {} is out of range",
                                b.start
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(AggregateResult::Buckets),
        }
    }
}
