//! Core types for the Home Assistant WebSocket client
//!
//! This crate provides the event payload types the hub pushes to event
//! subscribers (EventType, Event, Context) and the hub's calendar version.

mod context;
mod event;
mod version;

pub use context::Context;
pub use event::{Event, EventData, EventDecodeError, EventOrigin, EventType, MATCH_ALL};
pub use version::{CalVer, VersionParseError};

/// Standard event types fired by Home Assistant
pub mod events {
    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for service calls
    pub const CALL_SERVICE: &str = "call_service";
}
