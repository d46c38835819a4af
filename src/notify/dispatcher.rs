//! Fan-out of notification events to channels

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::sync::Cache;
use serde::Serialize;

use super::channel::{ChannelError, NotificationChannel};
use crate::state::{AlertState, NotificationEvent};

const DEDUP_CAPACITY: u64 = 100_000;

/// Delivery to one channel failed
#[derive(Debug, Clone, thiserror::Error)]
#[error("Dispatch of '{rule}' to channel '{channel}' failed: {source}")]
pub struct DispatchError {
    pub rule: String,
    pub channel: String,
    #[source]
    pub source: ChannelError,
}

/// A rule targets a channel that is not registered
#[derive(Debug, Clone, thiserror::Error)]
#[error("Rule '{rule}' targets unknown channel '{channel}'")]
pub struct ConfigurationDriftError {
    pub rule: String,
    pub channel: String,
}

/// What happened to one dispatched event
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failures: Vec<DispatchError>,
    pub drift: Vec<ConfigurationDriftError>,
    /// The event's transition was already dispatched; nothing was sent
    pub deduplicated: bool,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.drift.is_empty()
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    events: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
    drift: AtomicU64,
    deduplicated: AtomicU64,
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub events: u64,
    pub deliveries: u64,
    pub failures: u64,
    pub drift: u64,
    pub deduplicated: u64,
}

/// Identifies one transition of one rule
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct DispatchKey {
    rule: String,
    sequence: u64,
    state: AlertState,
}

impl DispatchKey {
    fn of(event: &NotificationEvent) -> Self {
        Self {
            rule: event.rule.clone(),
            sequence: event.sequence,
            state: event.state,
        }
    }
}

enum Delivery {
    Delivered(String),
    Failed(DispatchError),
    Drift(ConfigurationDriftError),
}

/// Delivers events to every channel a rule targets
pub struct NotificationDispatcher {
    channels: DashMap<String, Arc<dyn NotificationChannel>>,
    /// Transitions already dispatched
    dispatched: Cache<DispatchKey, ()>,
    counters: DispatchCounters,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::with_dedup_ttl(Duration::from_secs(24 * 60 * 60))
    }

    /// Remember dispatched transitions for `ttl`
    pub fn with_dedup_ttl(ttl: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            dispatched: Cache::builder()
                .max_capacity(DEDUP_CAPACITY)
                .time_to_live(ttl)
                .build(),
            counters: DispatchCounters::default(),
        }
    }

    /// Register a channel under its ID, replacing any previous one
    pub fn register(&self, channel: Arc<dyn NotificationChannel>) {
        let id = channel.id().to_string();
        tracing::info!(channel = %id, "Notification channel registered");
        self.channels.insert(id, channel);
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.channels.remove(id).is_some()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn has_channel(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// Drop dedup entries for a removed rule so a re-added rule starts fresh
    pub fn forget_rule(&self, rule: &str) {
        let keys: Vec<DispatchKey> = self
            .dispatched
            .iter()
            .filter(|(key, _)| key.rule == rule)
            .map(|(key, _)| (*key).clone())
            .collect();

        for key in keys {
            self.dispatched.invalidate(&key);
        }
    }

    /// Deliver `event` to each target channel independently
    ///
    /// Each transition of a rule is dispatched at most once; a failing or
    /// missing channel never prevents delivery to the others.
    pub async fn dispatch(
        &self,
        event: &NotificationEvent,
        targets: &BTreeSet<String>,
    ) -> DispatchReport {
        if !self.claim(event) {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                rule = %event.rule,
                sequence = event.sequence,
                "Transition already dispatched, skipping"
            );
            return DispatchReport {
                deduplicated: true,
                ..Default::default()
            };
        }
        self.counters.events.fetch_add(1, Ordering::Relaxed);

        let deliveries = targets.iter().map(|id| self.deliver(event, id));
        let mut report = DispatchReport::default();

        for delivery in futures::future::join_all(deliveries).await {
            match delivery {
                Delivery::Delivered(id) => {
                    self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
                    report.delivered.push(id);
                }
                Delivery::Failed(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    report.failures.push(e);
                }
                Delivery::Drift(e) => {
                    self.counters.drift.fetch_add(1, Ordering::Relaxed);
                    report.drift.push(e);
                }
            }
        }

        report
    }

    /// Mark the event's transition as dispatched; false if it already was
    fn claim(&self, event: &NotificationEvent) -> bool {
        self.dispatched
            .entry(DispatchKey::of(event))
            .or_insert(())
            .is_fresh()
    }

    async fn deliver(&self, event: &NotificationEvent, id: &str) -> Delivery {
        let channel = match self.channels.get(id) {
            Some(channel) => Arc::clone(channel.value()),
            None => {
                let drift = ConfigurationDriftError {
                    rule: event.rule.clone(),
                    channel: id.to_string(),
                };
                tracing::warn!(rule = %event.rule, channel = %id, "{}", drift);
                return Delivery::Drift(drift);
            }
        };

        match channel.send(event).await {
            Ok(()) => {
                tracing::debug!(rule = %event.rule, channel = %id, state = %event.state, "Notification delivered");
                Delivery::Delivered(id.to_string())
            }
            Err(source) => {
                let err = DispatchError {
                    rule: event.rule.clone(),
                    channel: id.to_string(),
                    source,
                };
                tracing::error!(rule = %event.rule, channel = %id, error = %err, "Failed to send notification");
                Delivery::Failed(err)
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            events: self.counters.events.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            drift: self.counters.drift.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
        }
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AlertRule, Criteria, Operator, QuerySemantics};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct RecordingChannel {
        id: String,
        fail: bool,
        received: Mutex<Vec<NotificationEvent>>,
    }

    impl RecordingChannel {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail,
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn id(&self) -> &str {
            &self.id
        }

        async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::Rejected(500));
            }
            self.received.lock().push(event.clone());
            Ok(())
        }
    }

    fn event(sequence: u64, state: AlertState) -> NotificationEvent {
        let rule = AlertRule::new(
            "errors",
            Criteria::query_threshold("errors", Operator::GreaterThan, 0.0, QuerySemantics::AnyBucket),
        );
        NotificationEvent::new(&rule, AlertState::Resolved, state, Utc::now(), sequence, None, String::new())
    }

    fn targets(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fans_out_to_all_targets() {
        let dispatcher = NotificationDispatcher::new();
        let a = RecordingChannel::new("a", false);
        let b = RecordingChannel::new("b", false);
        dispatcher.register(a.clone());
        dispatcher.register(b.clone());

        let report = dispatcher.dispatch(&event(1, AlertState::Firing), &targets(&["a", "b"])).await;
        assert!(report.is_clean());
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(a.received.lock().len(), 1);
        assert_eq!(b.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_channels() {
        let dispatcher = NotificationDispatcher::new();
        let broken = RecordingChannel::new("broken", true);
        let healthy = RecordingChannel::new("healthy", false);
        dispatcher.register(broken);
        dispatcher.register(healthy.clone());

        let report = dispatcher
            .dispatch(&event(1, AlertState::Firing), &targets(&["broken", "healthy"]))
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].channel, "broken");
        assert_eq!(report.delivered, vec!["healthy".to_string()]);
        assert_eq!(healthy.received.lock().len(), 1);
        assert_eq!(dispatcher.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_drift() {
        let dispatcher = NotificationDispatcher::new();
        let ops = RecordingChannel::new("ops", false);
        dispatcher.register(ops.clone());

        let report = dispatcher
            .dispatch(&event(1, AlertState::Firing), &targets(&["ops", "deleted"]))
            .await;
        assert_eq!(report.drift.len(), 1);
        assert_eq!(report.drift[0].channel, "deleted");
        assert_eq!(ops.received.lock().len(), 1);
        assert_eq!(dispatcher.stats().drift, 1);
    }

    #[tokio::test]
    async fn test_each_transition_dispatched_at_most_once() {
        let dispatcher = NotificationDispatcher::new();
        let ops = RecordingChannel::new("ops", false);
        dispatcher.register(ops.clone());
        let ids = targets(&["ops"]);

        let firing = event(1, AlertState::Firing);
        assert!(!dispatcher.dispatch(&firing, &ids).await.deduplicated);
        assert!(dispatcher.dispatch(&firing, &ids).await.deduplicated);

        let resolved = event(2, AlertState::Resolved);
        assert!(!dispatcher.dispatch(&resolved, &ids).await.deduplicated);

        assert_eq!(ops.received.lock().len(), 2);
        assert_eq!(dispatcher.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn test_forget_rule_resets_dedup() {
        let dispatcher = NotificationDispatcher::new();
        let ops = RecordingChannel::new("ops", false);
        dispatcher.register(ops.clone());
        let ids = targets(&["ops"]);

        dispatcher.dispatch(&event(1, AlertState::Firing), &ids).await;
        dispatcher.forget_rule("errors");
        let report = dispatcher.dispatch(&event(1, AlertState::Firing), &ids).await;

        assert!(!report.deduplicated);
        assert_eq!(ops.received.lock().len(), 2);
    }

    #[test]
    fn test_register_and_unregister() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.register(RecordingChannel::new("b", false));
        dispatcher.register(RecordingChannel::new("a", false));
        assert_eq!(dispatcher.channel_ids(), vec!["a".to_string(), "b".to_string()]);

        assert!(dispatcher.unregister("a"));
        assert!(!dispatcher.unregister("a"));
        assert!(!dispatcher.has_channel("a"));
    }
}
