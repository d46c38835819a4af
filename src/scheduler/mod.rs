//! Evaluation scheduling
//!
//! Rules are evaluated on a fixed-rate cadence with bounded concurrency.
//! A rule never has more than one evaluation in flight.

pub mod cadence;
pub mod worker;

pub use cadence::Cadence;
pub use worker::EvaluationScheduler;
