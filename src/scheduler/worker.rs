//! Background evaluation scheduler

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};

use super::cadence::Cadence;
use crate::config::EngineConfig;
use crate::engine::AlertEngine;
use crate::rules::AlertRule;

/// Floor for the tick resolution; a zero period cannot drive an interval
const MIN_TICK: Duration = Duration::from_millis(1);

/// Clears a rule's in-flight marker when its evaluation task ends,
/// including by panic or abort
struct InFlight {
    rule: String,
    in_flight: Arc<DashMap<String, ()>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.remove(&self.rule);
    }
}

/// Evaluates every enabled rule at its own fixed rate
///
/// At most one evaluation per rule runs at a time; a tick that comes due
/// while the previous one is still running is skipped, not queued.
/// Evaluations across rules share a bounded pool of permits.
pub struct EvaluationScheduler {
    engine: Arc<AlertEngine>,
    tick: Duration,
    shutdown_grace: Duration,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, ()>>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl EvaluationScheduler {
    pub fn new(engine: Arc<AlertEngine>, config: &EngineConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            tick: config.tick_resolution.max(MIN_TICK),
            shutdown_grace: config.shutdown_grace,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            in_flight: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Start the background loop
    ///
    /// The returned handle completes once shutdown has drained or aborted
    /// in-flight evaluations.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tracing::info!(
                max_concurrency = self.permits.available_permits(),
                "Evaluation scheduler started with tick {:?}",
                self.tick
            );

            let mut ticker = time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut cadences: HashMap<String, Cadence> = HashMap::new();
            let mut tasks: JoinSet<()> = JoinSet::new();

            while !*shutdown_rx.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.schedule_due(&mut cadences, &mut tasks);
                    }
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = joined {
                            if e.is_panic() {
                                tracing::error!(error = %e, "Evaluation task panicked");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {}
                }
            }

            self.drain(tasks).await;
            self.running.store(false, Ordering::SeqCst);
            tracing::info!("Evaluation scheduler stopped");
        })
    }

    /// Signal shutdown; no new evaluations start after this
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of rules with an evaluation in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Spawn an evaluation for every rule that is due
    fn schedule_due(&self, cadences: &mut HashMap<String, Cadence>, tasks: &mut JoinSet<()>) {
        let now = Instant::now();
        let snapshot = self.engine.snapshot();

        cadences.retain(|name, _| snapshot.get(name).is_some_and(|rule| rule.enabled));

        for rule in snapshot.iter().filter(|rule| rule.enabled) {
            let cadence = cadences
                .entry(rule.name.clone())
                .or_insert_with(|| Cadence::new(rule.frequency, now));
            cadence.retune(rule.frequency, now);

            if !cadence.is_due(now) {
                continue;
            }
            let lagged = cadence.advance(now);
            if lagged > 0 {
                tracing::debug!(rule = %rule.name, lagged, "Scheduler fell behind; periods skipped");
            }

            if self.in_flight.contains_key(&rule.name) {
                self.engine.record_skipped_tick();
                tracing::warn!(
                    rule = %rule.name,
                    frequency = ?rule.frequency,
                    "Previous evaluation still running; skipping tick"
                );
                continue;
            }

            self.spawn_evaluation(Arc::clone(rule), tasks);
        }
    }

    fn spawn_evaluation(&self, rule: Arc<AlertRule>, tasks: &mut JoinSet<()>) {
        self.in_flight.insert(rule.name.clone(), ());
        let guard = InFlight {
            rule: rule.name.clone(),
            in_flight: Arc::clone(&self.in_flight),
        };
        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);

        tasks.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            engine.evaluate(&rule, Utc::now()).await;
        });
    }

    /// Wait for in-flight evaluations up to the grace period, then abort
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        tracing::info!(
            in_flight = tasks.len(),
            "Waiting up to {:?} for in-flight evaluations",
            self.shutdown_grace
        );

        let drained = time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                aborted = tasks.len(),
                "Shutdown grace period elapsed; aborting evaluations"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}
