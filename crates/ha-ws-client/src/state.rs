//! Connection State Machine
//!
//! Enforces valid state transitions for the connection lifecycle:
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Connected
//!                    ↘              ↘              ↘
//!                     Disconnected   Disconnected   Disconnected
//! ```
//!
//! Every arrow back to Disconnected is a close, a cancellation, a failed
//! handshake or a lost channel.

use serde::Serialize;
use thiserror::Error;

/// State of the connection to the hub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel is open
    #[default]
    Disconnected,
    /// The channel is being opened, waiting for `auth_required`
    Connecting,
    /// The access token has been sent, waiting for `auth_ok`
    Authenticating,
    /// Authenticated and accepting commands
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Attempt a transition to a new state.
    pub fn try_transition(self, to: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState::*;

        let valid = matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, Connected)
                | (Authenticating, Disconnected)
                | (Connected, Disconnected)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// Check if a transition is valid without performing it
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        self.try_transition(to).is_ok()
    }

    /// Whether a connect attempt is in flight
    pub fn is_handshaking(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Authenticating)
    }
}
