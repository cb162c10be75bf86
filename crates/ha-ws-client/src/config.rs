//! Connection parameters and client tuning

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, ClientResult};

/// Environment variable holding the token of a Supervisor add-on
pub const SUPERVISOR_TOKEN_VAR: &str = "SUPERVISOR_TOKEN";

/// Endpoint of the hub when running as a Supervisor add-on
pub const SUPERVISOR_ENDPOINT: &str = "ws://supervisor/core/websocket";

/// Environment variables read by [`ConnectionParameters::from_env`]
pub const URL_VAR: &str = "HASS_URL";
pub const TOKEN_VAR: &str = "HASS_TOKEN";

/// Where to connect and how to authenticate
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    endpoint: Url,
    access_token: String,
}

impl ConnectionParameters {
    /// Parameters for a WebSocket endpoint (`ws://` or `wss://`)
    pub fn new(endpoint: &str, access_token: impl Into<String>) -> ClientResult<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            ClientError::InvalidParameters(format!("invalid endpoint '{}': {}", endpoint, e))
        })?;
        if endpoint.scheme() != "ws" && endpoint.scheme() != "wss" {
            return Err(ClientError::InvalidParameters(format!(
                "invalid URI scheme: {}",
                endpoint.scheme()
            )));
        }
        Ok(Self {
            endpoint,
            access_token: non_empty_token(access_token.into())?,
        })
    }

    /// Parameters derived from the HTTP base URL of an instance
    ///
    /// `http://host:8123` becomes `ws://host:8123/api/websocket`.
    pub fn from_instance_base_url(
        instance_base_url: &str,
        access_token: impl Into<String>,
    ) -> ClientResult<Self> {
        if instance_base_url.trim().is_empty() {
            return Err(ClientError::InvalidParameters(
                "instance base URL cannot be empty".to_string(),
            ));
        }
        let mut url = Url::parse(instance_base_url.trim()).map_err(|e| {
            ClientError::InvalidParameters(format!("invalid base URL '{}': {}", instance_base_url, e))
        })?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ClientError::InvalidParameters(format!(
                    "invalid URI scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            ClientError::InvalidParameters(format!("cannot use scheme {} for {}", scheme, url))
        })?;
        url.set_path("/api/websocket");
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            endpoint: url,
            access_token: non_empty_token(access_token.into())?,
        })
    }

    /// Parameters for an add-on talking to the hub through the Supervisor
    pub fn for_supervisor() -> ClientResult<Self> {
        let token = std::env::var(SUPERVISOR_TOKEN_VAR).map_err(|_| {
            ClientError::InvalidParameters(format!(
                "environment variable '{}' not set",
                SUPERVISOR_TOKEN_VAR
            ))
        })?;
        Self::new(SUPERVISOR_ENDPOINT, token)
    }

    /// Parameters from `HASS_URL` (HTTP base URL or WebSocket endpoint) and `HASS_TOKEN`
    pub fn from_env() -> ClientResult<Self> {
        let url = std::env::var(URL_VAR).map_err(|_| {
            ClientError::InvalidParameters(format!("environment variable '{}' not set", URL_VAR))
        })?;
        let token = std::env::var(TOKEN_VAR).map_err(|_| {
            ClientError::InvalidParameters(format!("environment variable '{}' not set", TOKEN_VAR))
        })?;
        if url.starts_with("ws://") || url.starts_with("wss://") {
            Self::new(&url, token)
        } else {
            Self::from_instance_base_url(&url, token)
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("endpoint", &self.endpoint.as_str())
            .field("access_token", &"<redacted>")
            .finish()
    }
}

fn non_empty_token(token: String) -> ClientResult<String> {
    if token.trim().is_empty() {
        return Err(ClientError::InvalidParameters(
            "access token cannot be empty".to_string(),
        ));
    }
    Ok(token)
}

/// Client behaviour knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Extra connect attempts after a transport failure; `None` retries until cancelled
    #[serde(default = "default_connect_retries")]
    pub connect_retries: Option<u32>,

    /// Pause between connect attempts
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Limit for opening the channel and completing authentication
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Buffered state notifications per listener
    #[serde(default = "default_state_channel_capacity")]
    pub state_channel_capacity: usize,
}

fn default_connect_retries() -> Option<u32> {
    Some(0)
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_state_channel_capacity() -> usize {
    16
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_retries: default_connect_retries(),
            retry_interval_secs: default_retry_interval_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            state_channel_capacity: default_state_channel_capacity(),
        }
    }
}

impl ClientConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
