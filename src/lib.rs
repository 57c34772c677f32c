//! # IEEE 802.11 / 802.11ah MAC channel access engine
//!
//! This crate implements the link-layer channel access machinery of an
//! IEEE 802.11 station for use inside a discrete-event network simulator.
//! It covers EDCA/DCF contention, RTS/CTS protection, acknowledgements and
//! Block Acks, MPDU aggregation, retry management, receive-side reordering
//! and the 802.11ah restricted access window overlay.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `frame`: MAC frame structures, serialization and parsing
//! - `access`: EDCA/DCF access categories and per-category backoff state
//! - `outgoing`: per-link transmit window and Block Ack session state
//! - `reorder`: receive-side duplicate detection and in-order delivery
//! - `raw`: 802.11ah restricted access window schedules and RPS parsing
//! - `seq`: circular sequence number arithmetic
//! - `addr`: MAC and network layer addressing
//! - `time`: simulation clock units and the duration field
//! - `wire`: low-level frame buffer utilities
//! - `engine`: the notification-driven channel access state machine

pub mod access;
pub mod addr;
pub mod frame;
pub mod outgoing;
pub mod raw;
pub mod reorder;
pub mod seq;
pub mod time;
pub mod wire;

// Engine modules
pub mod engine;

// Re-export commonly used types
pub use crate::{
    access::*,
    addr::*,
    frame::*,
    outgoing::*,
    raw::*,
    reorder::*,
    time::*,
    wire::*,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MacError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MacError>;

// Utility functions
pub fn init_logging() {
    env_logger::init();
}
