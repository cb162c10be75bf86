//! Context type carried by hub events

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Context of an event
///
/// Identifies who initiated the action that produced the event and links it
/// to the action that caused it. The hub sends `null` for the optional ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// User ID that initiated this action (if any)
    #[serde(default)]
    pub user_id: Option<String>,

    /// Parent context ID for tracking causality chains
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self::with_id(Ulid::new().to_string())
    }

    /// Create a new context with a specific ID
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            parent_id: None,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
