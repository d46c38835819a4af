//! Criteria evaluation
//!
//! One entry point, [`evaluate`], scores a telemetry result against either
//! kind of [`Criteria`](crate::rules::Criteria).

pub mod aggregation;
pub mod evaluator;

pub use aggregation::{aggregate, WindowAccumulator};
pub use evaluator::{evaluate, Evaluation, EvaluationResult, Outcome};
