#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use vigil::notify::{ChannelError, NotificationChannel, NotificationDispatcher};
use vigil::rules::{AlertRule, Criteria, Operator, QuerySemantics};
use vigil::state::NotificationEvent;
use vigil::telemetry::{AggregateResult, QueryDescriptor, RetryPolicy, TelemetryClient, TelemetryQueryError};
use vigil::AlertEngine;

pub type QueryResult = Result<AggregateResult, TelemetryQueryError>;

/// Plays back scripted results per query text; unscripted queries see no hits
#[derive(Default)]
pub struct ScriptedTelemetry {
    scripts: Mutex<HashMap<String, VecDeque<QueryResult>>>,
    calls: AtomicUsize,
}

impl ScriptedTelemetry {
    pub fn script(&self, query: &str, results: Vec<QueryResult>) {
        self.scripts
            .lock()
            .entry(query.to_string())
            .or_default()
            .extend(results);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetryClient for ScriptedTelemetry {
    async fn query(
        &self,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
        descriptor: &QueryDescriptor,
    ) -> QueryResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .get_mut(descriptor.text())
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(AggregateResult::Scalar(0.0)))
    }
}

/// Blocks every query until the gate is opened
pub struct GatedTelemetry {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedTelemetry {
    pub fn closed() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetryClient for GatedTelemetry {
    async fn query(
        &self,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
        _descriptor: &QueryDescriptor,
    ) -> QueryResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await;
        Ok(AggregateResult::Scalar(1.0))
    }
}

/// Records delivered events, or fails every delivery
pub struct RecordingChannel {
    id: String,
    fail: bool,
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingChannel {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            fail: false,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            fail: true,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
        if self.fail {
            return Err(ChannelError::Transport("connection refused".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

pub fn hits(n: f64) -> QueryResult {
    Ok(AggregateResult::Scalar(n))
}

pub fn failure() -> QueryResult {
    Err(TelemetryQueryError::Transport("backend unreachable".into()))
}

/// Query rule named `name` whose query text is also `name`
pub fn query_rule(name: &str, n: u32, m: u32, auto_mitigate: bool) -> AlertRule {
    AlertRule::new(
        name,
        Criteria::query_threshold(name, Operator::GreaterThan, 0.0, QuerySemantics::AnyBucket),
    )
    .with_failing_periods(n, m)
    .with_auto_mitigate(auto_mitigate)
    .with_channel("ops")
}

/// Engine wired to the given telemetry and a recording "ops" channel
pub fn engine_with(telemetry: Arc<dyn TelemetryClient>) -> (Arc<AlertEngine>, Arc<RecordingChannel>) {
    let ops = RecordingChannel::new("ops");
    let dispatcher = Arc::new(NotificationDispatcher::new());
    dispatcher.register(ops.clone());

    let engine = AlertEngine::new(telemetry, dispatcher)
        .with_retry_policy(RetryPolicy::no_retry(Duration::from_secs(5)));
    (Arc::new(engine), ops)
}
