//! Per-rule alert state
//!
//! Each rule keeps a sliding history of its last N outcomes and moves
//! between Resolved, Pending and Firing as that history changes.

pub mod checkpoint;
pub mod event;
pub mod machine;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointWorker};
pub use event::NotificationEvent;
pub use machine::{next_state, AlertState, OutcomeHistory, RuleState};
