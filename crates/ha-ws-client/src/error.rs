//! Error types for the WebSocket client

use thiserror::Error;

use crate::message::ErrorInfo;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while talking to the hub
///
/// Cancellation and connection loss are distinct variants: a caller can
/// always tell "I gave up" from "the hub refused" from "the link dropped".
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// The operation is not valid in the current connection state
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The client has been disposed
    #[error("client has been disposed")]
    Disposed,

    /// The caller's cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,

    /// The connection was closed or dropped while the operation was outstanding
    #[error("connection lost")]
    ConnectionLost,

    /// The hub rejected the access token
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The hub answered a command with a failed result
    #[error("command failed: {0}")]
    Remote(ErrorInfo),

    /// The underlying channel failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The hub sent a message that is not valid at this point of the handshake
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The handshake did not complete in time
    #[error("timed out waiting for the hub")]
    Timeout,

    /// Connection parameters or command payload are malformed
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

impl ClientError {
    /// Whether this is the outcome of a cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// Whether a connect attempt failing with this error may be retried
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::ConnectionLost)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}
