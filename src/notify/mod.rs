//! Notification delivery
//!
//! The dispatcher fans each transition event out to the channels a rule
//! names. Channels are independent: one failing never blocks another.

pub mod channel;
pub mod dispatcher;

pub use channel::{ChannelError, LogChannel, NotificationChannel, WebhookChannel};
pub use dispatcher::{
    ConfigurationDriftError, DispatchError, DispatchReport, DispatchStats, NotificationDispatcher,
};
pub use crate::state::NotificationEvent;
