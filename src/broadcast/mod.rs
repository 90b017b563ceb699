//! Event fan-out to streaming subscribers.
//!
//! One channel per session, one bounded queue per subscriber. See
//! [`service::EventBroadcaster`] for the delivery rules.

mod channel;
pub mod service;

pub use service::{
    spawn_broadcast_timers, BroadcastStats, ChannelStats, EventBroadcaster, EventStream,
};
