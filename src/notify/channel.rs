//! Notification channel interface and built-in channels

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::state::NotificationEvent;

/// A delivery target for notification events
///
/// Retrying is the channel's own business; the dispatcher calls `send`
/// once per event.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel ID rules refer to
    fn id(&self) -> &str;

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError>;
}

/// Channel delivery failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Endpoint returned status {0}")]
    Rejected(u16),
}

/// Logs events through tracing
pub struct LogChannel {
    id: String,
}

impl LogChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        tracing::warn!(
            rule = %event.rule,
            severity = %event.severity,
            previous = %event.previous,
            state = %event.state,
            sequence = event.sequence,
            "{}",
            event.description
        );
        Ok(())
    }
}

/// POSTs events as JSON to an HTTP endpoint
pub struct WebhookChannel {
    id: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        Ok(Self {
            id: id.into(),
            url: url.into(),
            headers: HashMap::new(),
            client,
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        let payload = serde_json::json!({
            "rule": event.rule,
            "summary": event.summary(),
            "description": event.description,
            "severity": event.severity,
            "severity_level": event.severity.level(),
            "previous": event.previous,
            "state": event.state,
            "sequence": event.sequence,
            "value": event.value,
            "timestamp": event.timestamp.to_rfc3339(),
        });

        let mut request = self.client.post(&self.url).json(&payload);

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to send webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChannelError::Rejected(response.status().as_u16()));
        }

        tracing::debug!(
            rule = %event.rule,
            channel = %self.id,
            url = %self.url,
            "Webhook notification sent"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AlertRule, Criteria, Operator, QuerySemantics};
    use crate::state::AlertState;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    fn sample_event() -> NotificationEvent {
        let rule = AlertRule::new(
            "errors",
            Criteria::query_threshold("errors", Operator::GreaterThan, 0.0, QuerySemantics::AnyBucket),
        );
        NotificationEvent::new(
            &rule,
            AlertState::Pending,
            AlertState::Firing,
            Utc::now(),
            2,
            Some(3.0),
            "2 of the last 3 evaluations met the criteria".into(),
        )
    }

    #[tokio::test]
    async fn test_log_channel() {
        let channel = LogChannel::new("log");
        assert_eq!(channel.id(), "log");
        assert!(channel.send(&sample_event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_delivers_payload_and_headers() {
        type Seen = Arc<Mutex<Vec<(serde_json::Value, Option<String>)>>>;
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let router = Router::new()
            .route(
                "/hook",
                post(
                    |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                        let token = headers
                            .get("x-token")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        seen.lock().await.push((body, token));
                        StatusCode::OK
                    },
                ),
            )
            .with_state(Arc::clone(&seen));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let channel = WebhookChannel::new("ops", format!("http://{}/hook", addr), Duration::from_secs(5))
            .unwrap()
            .with_header("x-token", "secret");
        assert_eq!(channel.url(), format!("http://{}/hook", addr));
        channel.send(&sample_event()).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0["rule"], "errors");
        assert_eq!(seen[0].0["state"], "Firing");
        assert_eq!(seen[0].0["sequence"], 2);
        assert_eq!(seen[0].1.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_webhook_non_success_is_error() {
        let router = Router::new().route("/hook", post(|| async { StatusCode::BAD_GATEWAY }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let channel =
            WebhookChannel::new("ops", format!("http://{}/hook", addr), Duration::from_secs(5)).unwrap();
        let err = channel.send(&sample_event()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(502)));
    }
}
