//! Event types pushed by the Home Assistant event bus

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Context;

/// Trait for typed event data
///
/// Implement this trait for payloads that belong to a single, well-known
/// event type so they can be decoded from a raw [`Event`].
pub trait EventData: DeserializeOwned + Clone + Send + Sync + 'static {
    /// The event type string for this data type
    fn event_type() -> &'static str;
}

/// Event type identifier
///
/// Also used as the subscription filter: [`EventType::match_all`] stands for
/// "every event" and is sent as an absent `event_type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Create a new event type
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    /// Get the event type as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Special event type that matches all events
    pub fn match_all() -> Self {
        Self(MATCH_ALL.to_string())
    }

    /// Check if this is the MATCH_ALL event type
    pub fn is_match_all(&self) -> bool {
        self.0 == MATCH_ALL
    }

    /// The value to put in a `subscribe_events` command, `None` for all events
    pub fn as_filter(&self) -> Option<&str> {
        if self.is_match_all() {
            None
        } else {
            Some(&self.0)
        }
    }
}

/// Wildcard used by Home Assistant for "all events"
pub const MATCH_ALL: &str = "*";

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<Option<&str>> for EventType {
    fn from(s: Option<&str>) -> Self {
        s.map(Self::new).unwrap_or_else(Self::match_all)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event as delivered by the hub to a `subscribe_events` subscriber
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    /// The type of event
    pub event_type: EventType,

    /// The event data
    pub data: T,

    /// Origin of the event (local, remote)
    #[serde(default)]
    pub origin: EventOrigin,

    /// When the event was fired
    pub time_fired: DateTime<Utc>,

    /// Context tracking the origin and causality
    #[serde(default)]
    pub context: Context,
}

impl Event<serde_json::Value> {
    /// Decode the data of an untyped event
    ///
    /// Fails when the event type does not belong to `T` or the data does not
    /// match its shape.
    pub fn decode<T: EventData>(self) -> Result<Event<T>, EventDecodeError> {
        if self.event_type.as_str() != T::event_type() {
            return Err(EventDecodeError::WrongType {
                expected: T::event_type(),
                actual: self.event_type,
            });
        }
        let data = serde_json::from_value(self.data)?;
        Ok(Event {
            event_type: self.event_type,
            data,
            origin: self.origin,
            time_fired: self.time_fired,
            context: self.context,
        })
    }
}

/// Errors raised while decoding typed event data
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("expected event type '{expected}', got '{actual}'")]
    WrongType {
        expected: &'static str,
        actual: EventType,
    },

    #[error("invalid event data: {0}")]
    Data(#[from] serde_json::Error),
}

/// Origin of an event
///
/// The hub sends these in upper case (`"LOCAL"`), lower case is accepted too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOrigin {
    /// Event originated on the hub
    #[default]
    #[serde(alias = "local")]
    Local,
    /// Event was forwarded from a remote instance
    #[serde(alias = "remote")]
    Remote,
}
