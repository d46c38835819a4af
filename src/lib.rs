//! Vigil: Threshold & Query Alert Evaluation Engine
//!
//! Periodically evaluates declared alert rules against a telemetry backend,
//! confirms breaches across several evaluation periods before firing, and
//! notifies channels when a rule changes state.
//!
//! # Features
//!
//! - **Static thresholds**: aggregate a metric over a window (sum, avg, min, max, count)
//! - **Query thresholds**: compare the result of an opaque backend query
//! - **Failing periods**: fire only when M of the last N evaluations breach
//! - **Auto-mitigation**: resolve automatically, or hold until cleared
//! - **Fixed-rate scheduling**: bounded concurrency, overlapping ticks skipped
//! - **Fan-out notifications**: independent channels, one dispatch per transition
//! - **Checkpoints**: rule states survive restarts
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vigil::engine::AlertEngine;
//! use vigil::notify::{LogChannel, NotificationDispatcher};
//! use vigil::rules::{AlertRule, Criteria, Operator, QuerySemantics};
//! use vigil::telemetry::HttpTelemetryClient;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let telemetry = HttpTelemetryClient::new("http://127.0.0.1:8080", Duration::from_secs(30))?;
//! let dispatcher = Arc::new(NotificationDispatcher::new());
//! dispatcher.register(Arc::new(LogChannel::new("log")));
//! let engine = AlertEngine::new(Arc::new(telemetry), dispatcher);
//!
//! // Fire when errors show up in 2 of the last 3 five-minute windows
//! let rule = AlertRule::new(
//!     "checkout-errors",
//!     Criteria::query_threshold("errors | where service == 'checkout'", Operator::GreaterThan, 0.0, QuerySemantics::AnyBucket),
//! )
//! .with_failing_periods(3, 2)
//! .with_channel("log");
//! engine.upsert(rule)?;
//!
//! let rule = engine.rule("checkout-errors").unwrap();
//! let report = engine.evaluate(&rule, chrono::Utc::now()).await;
//! println!("{:?}", report.result.outcome);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod criteria;
pub mod engine;
pub mod notify;
pub mod rules;
pub mod scheduler;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use config::{EngineConfig, ServerConfig};
pub use engine::{AlertEngine, EngineStats, EvaluationReport};
pub use rules::{AlertRule, Criteria, InvalidRuleError, RuleRegistry};
pub use state::{AlertState, NotificationEvent};
pub use telemetry::{TelemetryClient, TelemetryQueryError};
