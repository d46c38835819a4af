//! Alert engine
//!
//! Owns the rule registry and the per-rule states. One evaluation runs the
//! rule's query, scores it against the criteria, feeds the outcome into the
//! rule's state machine and dispatches any resulting transition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::criteria::{self, EvaluationResult, Outcome};
use crate::notify::{DispatchReport, NotificationDispatcher, NotificationEvent};
use crate::rules::{AlertRule, InvalidRuleError, RuleRegistry, RuleSnapshot};
use crate::state::{AlertState, Checkpoint, RuleState};
use crate::telemetry::{query_with_retry, RetryPolicy, TelemetryClient};

/// Operation on a rule that is not registered
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown rule '{0}'")]
pub struct UnknownRuleError(pub String);

/// Everything one evaluation produced
#[derive(Debug)]
pub struct EvaluationReport {
    pub result: EvaluationResult,
    /// Transition caused by this evaluation, if any
    pub event: Option<NotificationEvent>,
    pub dispatch: Option<DispatchReport>,
    /// The rule was removed while its query was in flight; nothing was recorded
    pub discarded: bool,
}

#[derive(Debug, Default)]
struct EngineCounters {
    evaluations: AtomicU64,
    indeterminate: AtomicU64,
    transitions: AtomicU64,
    skipped_ticks: AtomicU64,
    discarded: AtomicU64,
}

/// Engine counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub rules: usize,
    pub firing: usize,
    pub pending: usize,
    pub evaluations: u64,
    pub indeterminate: u64,
    pub transitions: u64,
    pub skipped_ticks: u64,
    pub discarded: u64,
    pub dispatch: crate::notify::DispatchStats,
}

/// Evaluates rules and tracks their alert state
pub struct AlertEngine {
    registry: RuleRegistry,
    states: DashMap<String, RuleState>,
    telemetry: Arc<dyn TelemetryClient>,
    dispatcher: Arc<NotificationDispatcher>,
    retry: RetryPolicy,
    counters: EngineCounters,
}

impl AlertEngine {
    pub fn new(telemetry: Arc<dyn TelemetryClient>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            registry: RuleRegistry::new(),
            states: DashMap::new(),
            telemetry,
            dispatcher,
            retry: RetryPolicy::default(),
            counters: EngineCounters::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ========================================================================
    // Rule configuration
    // ========================================================================

    /// Register or replace a rule
    ///
    /// Replacing a rule keeps its state; the history is re-fitted when the
    /// number of evaluation periods changed.
    pub fn upsert(&self, rule: AlertRule) -> Result<Option<Arc<AlertRule>>, InvalidRuleError> {
        for channel in &rule.channels {
            if !self.dispatcher.has_channel(channel) {
                tracing::warn!(rule = %rule.name, channel = %channel, "Rule targets an unregistered channel");
            }
        }

        let name = rule.name.clone();
        let previous = self.registry.upsert(rule)?;

        if let Some(current) = self.registry.get(&name) {
            if let Some(mut state) = self.states.get_mut(&name) {
                state.fit(&current);
            }
        }

        match &previous {
            Some(_) => tracing::info!(rule = %name, "Alert rule updated"),
            None => tracing::info!(rule = %name, "Alert rule registered"),
        }

        Ok(previous)
    }

    /// Remove a rule and its state; unknown names are a no-op
    pub fn remove(&self, name: &str) -> Option<Arc<AlertRule>> {
        let removed = self.registry.remove(name);
        self.states.remove(name);
        self.dispatcher.forget_rule(name);

        if removed.is_some() {
            tracing::info!(rule = %name, "Alert rule removed");
        }
        removed
    }

    /// Enable or disable a rule; returns false for unknown rules
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, InvalidRuleError> {
        let Some(rule) = self.registry.get(name) else {
            return Ok(false);
        };
        if rule.enabled != enabled {
            self.registry.upsert(AlertRule::clone(&rule).with_enabled(enabled))?;
            tracing::info!(rule = %name, enabled, "Alert rule toggled");
        }
        Ok(true)
    }

    pub fn rule(&self, name: &str) -> Option<Arc<AlertRule>> {
        self.registry.get(name)
    }

    pub fn snapshot(&self) -> RuleSnapshot {
        self.registry.snapshot()
    }

    /// Copy of a rule's current state, if it has been evaluated
    pub fn state(&self, name: &str) -> Option<RuleState> {
        self.states.get(name).map(|s| s.value().clone())
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Run one evaluation of `rule` for the window ending at `now`
    pub async fn evaluate(&self, rule: &AlertRule, now: DateTime<Utc>) -> EvaluationReport {
        let window_start = window_start(rule, now);
        let descriptor = rule.criteria.descriptor();

        let (query, attempts) =
            query_with_retry(self.telemetry.as_ref(), &self.retry, window_start, now, &descriptor).await;

        if let Err(e) = &query {
            tracing::error!(
                rule = %rule.name,
                attempts,
                error = %e,
                "Telemetry query failed; outcome is indeterminate"
            );
        }

        let evaluation = criteria::evaluate(&rule.criteria, window_start, &query);
        let result = EvaluationResult {
            rule: rule.name.clone(),
            timestamp: now,
            window_start,
            value: evaluation.value,
            outcome: evaluation.outcome,
            detail: evaluation.detail,
            attempts,
        };

        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        if result.outcome == Outcome::Indeterminate {
            self.counters.indeterminate.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            rule = %rule.name,
            outcome = ?result.outcome,
            value = ?result.value,
            "{}",
            result.detail
        );

        let (event, discarded) = match self.record(rule, &result) {
            Some(recorded) => (recorded, false),
            None => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(rule = %rule.name, "Rule removed during evaluation; result discarded");
                (None, true)
            }
        };

        let dispatch = match &event {
            Some((current, event)) => Some(self.notify(current, event).await),
            None => None,
        };
        let event = event.map(|(_, event)| event);

        EvaluationReport {
            result,
            event,
            dispatch,
            discarded,
        }
    }

    /// Apply a result to the rule's state
    ///
    /// Returns `None` when the rule is no longer registered. The registry is
    /// read while the state entry is held so that a concurrent removal can
    /// never leave a state behind. The failing-period settings come from the
    /// rule as currently registered, so an evaluation that started before an
    /// update cannot roll the history back to the old definition.
    fn record(
        &self,
        rule: &AlertRule,
        result: &EvaluationResult,
    ) -> Option<Option<(Arc<AlertRule>, NotificationEvent)>> {
        let entry = self.states.entry(rule.name.clone());
        let current = self.registry.get(&rule.name)?;

        let event = match entry {
            Entry::Occupied(mut entry) => entry.get_mut().apply(&current, result),
            Entry::Vacant(entry) => {
                let mut state = RuleState::new(current.failing_periods.evaluation_periods);
                let event = state.apply(&current, result);
                entry.insert(state);
                event
            }
        };
        Some(event.map(|event| (current, event)))
    }

    async fn notify(&self, rule: &AlertRule, event: &NotificationEvent) -> DispatchReport {
        self.counters.transitions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            rule = %rule.name,
            severity = %rule.severity,
            previous = %event.previous,
            state = %event.state,
            sequence = event.sequence,
            "Alert state changed"
        );

        let report = self.dispatcher.dispatch(event, &rule.channels).await;

        if let Some(mut state) = self.states.get_mut(&rule.name) {
            if state.transitions == event.sequence {
                state.mark_notified(event.state);
            }
        }

        report
    }

    /// Operator clear: reset a rule's history and resolve it
    ///
    /// Dispatches a Resolved notification if the rule was not already
    /// resolved.
    pub async fn clear(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationEvent>, UnknownRuleError> {
        let rule = self
            .registry
            .get(name)
            .ok_or_else(|| UnknownRuleError(name.to_string()))?;

        let event = match self.states.get_mut(name) {
            Some(mut state) => state.clear(&rule, now),
            None => None,
        };

        if let Some(event) = &event {
            self.notify(&rule, event).await;
        }
        Ok(event)
    }

    /// Count a tick skipped because the previous evaluation was still running
    pub fn record_skipped_tick(&self) {
        self.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EngineStats {
        let (mut firing, mut pending) = (0, 0);
        for state in self.states.iter() {
            match state.state {
                AlertState::Firing => firing += 1,
                AlertState::Pending => pending += 1,
                AlertState::Resolved => {}
            }
        }

        EngineStats {
            rules: self.registry.len(),
            firing,
            pending,
            evaluations: self.counters.evaluations.load(Ordering::Relaxed),
            indeterminate: self.counters.indeterminate.load(Ordering::Relaxed),
            transitions: self.counters.transitions.load(Ordering::Relaxed),
            skipped_ticks: self.counters.skipped_ticks.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            dispatch: self.dispatcher.stats(),
        }
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    /// Capture every registered rule and rule state
    pub fn checkpoint(&self) -> Checkpoint {
        let rules = self
            .registry
            .snapshot()
            .iter()
            .map(|rule| AlertRule::clone(rule))
            .collect();
        let states: BTreeMap<String, RuleState> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Checkpoint::new(rules, states)
    }

    /// Restore from a checkpoint
    ///
    /// Checkpointed rules are registered unless a rule with the same name
    /// already is. States are restored only for registered rules. Returns
    /// the number of states restored.
    pub fn restore(&self, checkpoint: Checkpoint) -> usize {
        for rule in checkpoint.rules {
            if self.registry.contains(&rule.name) {
                continue;
            }
            let name = rule.name.clone();
            if let Err(e) = self.registry.upsert(rule) {
                tracing::error!(rule = %name, error = %e, "Skipping invalid checkpointed rule");
            }
        }

        let mut restored = 0;

        for (name, mut state) in checkpoint.states {
            let Some(rule) = self.registry.get(&name) else {
                tracing::debug!(rule = %name, "Skipping checkpointed state for unknown rule");
                continue;
            };
            state.fit(&rule);
            self.states.insert(name, state);
            restored += 1;
        }

        tracing::info!(restored, saved_at = %checkpoint.saved_at, "Rule states restored from checkpoint");
        restored
    }
}

fn window_start(rule: &AlertRule, now: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(rule.window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelError, NotificationChannel};
    use crate::rules::{Criteria, Operator, QuerySemantics};
    use crate::telemetry::{AggregateResult, QueryDescriptor, TelemetryQueryError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Returns scripted results in order, then `NotMet`-producing zeros
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<AggregateResult, TelemetryQueryError>>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<AggregateResult, TelemetryQueryError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl TelemetryClient for ScriptedClient {
        async fn query(
            &self,
            _window_start: DateTime<Utc>,
            _window_end: DateTime<Utc>,
            _descriptor: &QueryDescriptor,
        ) -> Result<AggregateResult, TelemetryQueryError> {
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Ok(AggregateResult::Scalar(0.0)))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<NotificationEvent>>,
    }

    #[async_trait]
    impl NotificationChannel for Recorder {
        fn id(&self) -> &str {
            "recorder"
        }

        async fn send(&self, event: &NotificationEvent) -> Result<(), ChannelError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn hits(n: f64) -> Result<AggregateResult, TelemetryQueryError> {
        Ok(AggregateResult::Scalar(n))
    }

    fn engine(script: Vec<Result<AggregateResult, TelemetryQueryError>>) -> (AlertEngine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(NotificationDispatcher::new());
        dispatcher.register(recorder.clone());
        let engine = AlertEngine::new(ScriptedClient::new(script), dispatcher)
            .with_retry_policy(RetryPolicy::no_retry(Duration::from_secs(1)));
        (engine, recorder)
    }

    fn rule(n: u32, m: u32) -> AlertRule {
        AlertRule::new(
            "errors",
            Criteria::query_threshold("errors | count", Operator::GreaterThan, 0.0, QuerySemantics::AnyBucket),
        )
        .with_failing_periods(n, m)
        .with_channel("recorder")
    }

    #[tokio::test]
    async fn test_evaluate_fires_and_notifies_once() {
        let (engine, recorder) = engine(vec![hits(1.0), hits(0.0), hits(2.0), hits(3.0)]);
        engine.upsert(rule(3, 2)).unwrap();
        let rule = engine.rule("errors").unwrap();

        for _ in 0..4 {
            engine.evaluate(&rule, Utc::now()).await;
        }

        let events = recorder.events.lock();
        let states: Vec<AlertState> = events.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![AlertState::Pending, AlertState::Firing]);

        let state = engine.state("errors").unwrap();
        assert_eq!(state.state, AlertState::Firing);
        assert_eq!(state.last_notified, Some(AlertState::Firing));
        assert_eq!(engine.stats().transitions, 2);
    }

    #[tokio::test]
    async fn test_query_failure_is_indeterminate() {
        let (engine, recorder) = engine(vec![Err(TelemetryQueryError::Transport("down".into()))]);
        engine.upsert(rule(1, 1)).unwrap();
        let rule = engine.rule("errors").unwrap();

        let report = engine.evaluate(&rule, Utc::now()).await;
        assert_eq!(report.result.outcome, Outcome::Indeterminate);
        assert!(report.event.is_none());
        assert!(recorder.events.lock().is_empty());
        assert_eq!(engine.stats().indeterminate, 1);
    }

    #[tokio::test]
    async fn test_stale_evaluation_uses_updated_definition() {
        let (engine, recorder) = engine(vec![hits(1.0), hits(1.0)]);
        engine.upsert(rule(5, 1)).unwrap();
        let stale = engine.rule("errors").unwrap();

        engine.evaluate(&stale, Utc::now()).await;
        assert_eq!(engine.state("errors").unwrap().state, AlertState::Firing);

        // Updated while an evaluation holding the old definition is in flight
        engine.upsert(rule(3, 3)).unwrap();
        engine.evaluate(&stale, Utc::now()).await;

        let state = engine.state("errors").unwrap();
        assert_eq!(state.history.capacity(), 3);
        assert_eq!(state.state, AlertState::Pending);

        let states: Vec<AlertState> = recorder.events.lock().iter().map(|e| e.state).collect();
        assert_eq!(states, vec![AlertState::Firing, AlertState::Pending]);
    }

    #[tokio::test]
    async fn test_removed_rule_leaves_no_state() {
        let (engine, _) = engine(vec![hits(1.0)]);
        engine.upsert(rule(1, 1)).unwrap();
        let rule = engine.rule("errors").unwrap();

        engine.remove("errors");
        let report = engine.evaluate(&rule, Utc::now()).await;

        assert!(report.discarded);
        assert!(engine.state("errors").is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (engine, _) = engine(vec![]);
        engine.upsert(rule(1, 1)).unwrap();
        assert!(engine.remove("errors").is_some());
        assert!(engine.remove("errors").is_none());
        assert!(engine.remove("never-existed").is_none());
    }

    #[tokio::test]
    async fn test_clear_resolves_sticky_alert() {
        let (engine, recorder) = engine(vec![hits(1.0)]);
        engine.upsert(rule(1, 1).with_auto_mitigate(false)).unwrap();
        let rule = engine.rule("errors").unwrap();
        engine.evaluate(&rule, Utc::now()).await;

        let event = engine.clear("errors", Utc::now()).await.unwrap().unwrap();
        assert_eq!(event.state, AlertState::Resolved);
        assert_eq!(recorder.events.lock().len(), 2);
        assert!(engine.clear("missing", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_update_refits_history() {
        let (engine, _) = engine(vec![hits(1.0), hits(1.0), hits(1.0)]);
        engine.upsert(rule(5, 5)).unwrap();
        let rule5 = engine.rule("errors").unwrap();
        for _ in 0..3 {
            engine.evaluate(&rule5, Utc::now()).await;
        }

        engine.upsert(rule(2, 2)).unwrap();
        let state = engine.state("errors").unwrap();
        assert_eq!(state.history.capacity(), 2);
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_restores_rules_and_states() {
        let (engine, _) = engine(vec![hits(1.0)]);
        engine.upsert(rule(3, 2)).unwrap();
        let rule = engine.rule("errors").unwrap();
        engine.evaluate(&rule, Utc::now()).await;
        let checkpoint = engine.checkpoint();
        assert_eq!(checkpoint.rules.len(), 1);

        let (fresh, _) = self::engine(vec![]);
        assert_eq!(fresh.restore(checkpoint), 1);
        assert!(fresh.rule("errors").is_some());
        assert_eq!(fresh.state("errors").unwrap().state, AlertState::Pending);
    }

    #[tokio::test]
    async fn test_restore_skips_states_of_unknown_rules() {
        let (engine, _) = engine(vec![hits(1.0)]);
        engine.upsert(rule(3, 2)).unwrap();
        let rule = engine.rule("errors").unwrap();
        engine.evaluate(&rule, Utc::now()).await;
        let mut checkpoint = engine.checkpoint();
        checkpoint.rules.clear();

        let (fresh, _) = self::engine(vec![]);
        assert_eq!(fresh.restore(checkpoint), 0);
        assert!(fresh.state("errors").is_none());
    }

    #[tokio::test]
    async fn test_restore_keeps_registered_rule_definition() {
        let (engine, _) = engine(vec![]);
        engine.upsert(rule(3, 2)).unwrap();
        let checkpoint = engine.checkpoint();

        let (fresh, _) = self::engine(vec![]);
        fresh.upsert(self::rule(5, 1)).unwrap();
        fresh.restore(checkpoint);
        assert_eq!(fresh.rule("errors").unwrap().failing_periods.evaluation_periods, 5);
    }

    #[tokio::test]
    async fn test_set_enabled() {
        let (engine, _) = engine(vec![]);
        engine.upsert(rule(1, 1)).unwrap();

        assert!(engine.set_enabled("errors", false).unwrap());
        assert!(!engine.rule("errors").unwrap().enabled);
        assert!(!engine.set_enabled("missing", true).unwrap());
    }

    #[test]
    fn test_window_start() {
        let now = Utc::now();
        let rule = rule(1, 1).with_window(Duration::from_secs(300));
        assert_eq!(window_start(&rule, now), now - chrono::Duration::minutes(5));
    }
}
