//! WebSocket message types
//!
//! Defines the envelopes exchanged with the hub. Every frame is a JSON
//! object tagged by its `type` field.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, ClientResult};

// =============================================================================
// Incoming Messages
// =============================================================================

/// Incoming WebSocket message from the hub
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Pong {
        id: u64,
    },
    Result(ResultMessage),
    Event(EventMessage),
}

impl IncomingMessage {
    /// Decode a text frame
    pub fn from_frame(frame: &str) -> ClientResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// The `type` discriminator, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            IncomingMessage::AuthRequired { .. } => "auth_required",
            IncomingMessage::AuthOk { .. } => "auth_ok",
            IncomingMessage::AuthInvalid { .. } => "auth_invalid",
            IncomingMessage::Pong { .. } => "pong",
            IncomingMessage::Result(_) => "result",
            IncomingMessage::Event(_) => "event",
        }
    }
}

/// Answer to a command, matched by `id`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultMessage {
    pub id: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// Event pushed for a subscription; `id` is the subscribing command's id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: u64,
    pub event: Value,
}

impl EventMessage {
    /// Decode the opaque event payload
    pub fn decode<T: DeserializeOwned>(&self) -> ClientResult<T> {
        Ok(T::deserialize(&self.event)?)
    }

    /// Decode the payload of a `subscribe_events` subscription
    pub fn hass_event(&self) -> ClientResult<ha_core::Event> {
        self.decode()
    }
}

// =============================================================================
// Errors reported by the hub
// =============================================================================

/// Error code carried by a failed result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// A non-increasing identifier has been supplied
    IdReuse,
    /// The command did not pass validation on the hub
    InvalidFormat,
    /// Requested item cannot be found
    NotFound,
    /// Action not supported
    NotSupported,
    /// General Home Assistant exception
    HomeAssistantError,
    /// The command type is not recognized
    UnknownCommand,
    /// Unexpected error on the hub
    UnknownError,
    /// The user is not allowed to perform the action
    Unauthorized,
    /// The action exceeded its time limit
    Timeout,
    /// A template failed to render
    TemplateError,
    /// Any other code sent by the hub
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::IdReuse => "id_reuse",
            ErrorCode::InvalidFormat => "invalid_format",
            ErrorCode::NotFound => "not_found",
            ErrorCode::NotSupported => "not_supported",
            ErrorCode::HomeAssistantError => "home_assistant_error",
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::UnknownError => "unknown_error",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Timeout => "timeout",
            ErrorCode::TemplateError => "template_error",
            ErrorCode::Other(code) => code,
        }
    }

    /// Codes that point at a malformed request rather than at hub state
    pub fn is_client_bug(&self) -> bool {
        matches!(self, ErrorCode::IdReuse | ErrorCode::InvalidFormat)
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "id_reuse" => ErrorCode::IdReuse,
            "invalid_format" => ErrorCode::InvalidFormat,
            "not_found" => ErrorCode::NotFound,
            "not_supported" => ErrorCode::NotSupported,
            "home_assistant_error" => ErrorCode::HomeAssistantError,
            "unknown_command" => ErrorCode::UnknownCommand,
            "unknown_error" => ErrorCode::UnknownError,
            "unauthorized" => ErrorCode::Unauthorized,
            "timeout" => ErrorCode::Timeout,
            "template_error" => ErrorCode::TemplateError,
            _ => ErrorCode::Other(code),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Other(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error details of a failed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_placeholders: Option<HashMap<String, String>>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            translation_key: None,
            translation_domain: None,
            translation_placeholders: None,
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// =============================================================================
// Outgoing Messages
// =============================================================================

/// Handshake and liveness messages sent by the client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage<'a> {
    Auth { access_token: &'a str },
    Ping { id: u64 },
}

impl OutgoingMessage<'_> {
    pub fn to_frame(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A command whose payload is produced outside of the session engine
///
/// The engine only adds the `id` and `type` fields when the command is
/// written to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    command_type: String,
    payload: Map<String, Value>,
}

impl RawCommand {
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            payload: Map::new(),
        }
    }

    /// Build a command from any payload serializing to a JSON object
    pub fn with_payload<T: Serialize>(
        command_type: impl Into<String>,
        payload: &T,
    ) -> ClientResult<Self> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ClientError::InvalidParameters(format!(
                    "command payload must be an object, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            command_type: command_type.into(),
            payload,
        })
    }

    /// Add a single field to the payload
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Serialize the command as it goes on the wire under `id`
    ///
    /// `id` and `type` keys in the payload are replaced by the envelope's own.
    pub(crate) fn to_frame(&self, id: u64) -> ClientResult<String> {
        let mut envelope = Map::with_capacity(self.payload.len() + 2);
        envelope.insert("id".to_string(), Value::from(id));
        envelope.insert("type".to_string(), Value::from(self.command_type.as_str()));
        for (key, value) in &self.payload {
            if key != "id" && key != "type" {
                envelope.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::to_string(&envelope)?)
    }
}

/// `subscribe_events` for one event type, or all events for the match-all filter
pub(crate) fn subscribe_events(filter: &ha_core::EventType) -> RawCommand {
    let command = RawCommand::new("subscribe_events");
    match filter.as_filter() {
        Some(event_type) => command.field("event_type", event_type),
        None => command,
    }
}

/// `unsubscribe_events` for a subscription id
pub(crate) fn unsubscribe_events(subscription_id: u64) -> RawCommand {
    RawCommand::new("unsubscribe_events").field("subscription", subscription_id)
}

// =============================================================================
// Command Results
// =============================================================================

/// Outcome of a command as reported by the hub
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub id: u64,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<ErrorInfo>,
}

impl CommandResult {
    pub(crate) fn pong(id: u64) -> Self {
        Self {
            id,
            success: true,
            result: None,
            error: None,
        }
    }

    /// Turn a failed result into [`ClientError::Remote`]
    pub fn into_result(self) -> ClientResult<Option<Value>> {
        if self.success {
            return Ok(self.result);
        }
        Err(ClientError::Remote(self.error.unwrap_or_else(|| {
            ErrorInfo::new(ErrorCode::UnknownError, "command failed without error details")
        })))
    }

    /// Decode the result payload of a successful command
    pub fn deserialize<T: DeserializeOwned>(self) -> ClientResult<T> {
        let value = self.into_result()?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

impl From<ResultMessage> for CommandResult {
    fn from(msg: ResultMessage) -> Self {
        Self {
            id: msg.id,
            success: msg.success,
            result: msg.result,
            error: msg.error,
        }
    }
}
