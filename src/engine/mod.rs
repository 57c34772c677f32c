//! MAC engine module
//!
//! This module contains the channel access engine for a single interface.
//! It provides the notification-driven state machine, configuration
//! management, the network output queue, and the traits through which the
//! engine asks its environment for rates, power levels and next hops.

pub mod config;
pub mod core;
pub mod events;
pub mod queue;

// Re-export main types
pub use self::config::{
    AggregationConfig, ContentionConfig, MacConfig, QosType, QueueConfig, TimingConfig,
    MAX_TRANSMIT_OPPORTUNITY_DURATION,
};
pub use self::core::{MacEngine, MacState, MacStats, SentFrameKind};
pub use self::events::*;
pub use self::queue::*;
