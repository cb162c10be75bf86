//! Home Assistant WebSocket API client
//!
//! Session engine for the Home Assistant WebSocket API: connection
//! lifecycle with the auth handshake, command/result correlation and event
//! subscriptions multiplexed onto one channel.
//! Based on: https://developers.home-assistant.io/docs/api/websocket
//!
//! ```no_run
//! use ha_ws_client::{CancellationToken, ConnectionParameters, EventHandler, RawCommand, WsClient};
//!
//! # async fn run() -> Result<(), ha_ws_client::ClientError> {
//! let client = WsClient::default();
//! let cancel = CancellationToken::new();
//! let params = ConnectionParameters::from_instance_base_url("http://homeassistant.local:8123", "token")?;
//! client.connect(&params, &cancel).await?;
//!
//! let states = client.send_command(&RawCommand::new("get_states"), &cancel).await?;
//! println!("{:?}", states.into_result()?);
//!
//! let (handler, mut queue) = EventHandler::queue();
//! client.add_event_handler("state_changed", handler, &cancel).await?;
//! while let Some(event) = queue.next_event().await? {
//!     println!("{}", event.event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
mod connection;
mod dispatcher;
pub mod error;
pub mod message;
pub mod state;
mod subscription;
pub mod transport;

pub use config::{ClientConfig, ConnectionParameters};
pub use connection::WsClient;
pub use error::{ClientError, ClientResult};
pub use message::{
    CommandResult, ErrorCode, ErrorInfo, EventMessage, IncomingMessage, OutgoingMessage,
    RawCommand, ResultMessage,
};
pub use state::{ConnectionState, InvalidTransition};
pub use subscription::{EventHandler, EventQueue, HandlerId, SubscriptionInfo};
pub use transport::{Connector, FrameSink, FrameStream, TungsteniteConnector};

// Re-exported so callers can name filters and decode events without a direct dependency
pub use ha_core::{CalVer, Event, EventType};
pub use tokio_util::sync::CancellationToken;
