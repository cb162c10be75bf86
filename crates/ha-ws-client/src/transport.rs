//! Bidirectional message channel to the hub
//!
//! The session engine never touches sockets directly. A [`Connector`] opens
//! a channel and hands back its two halves: the sink is written by callers
//! (serialized by the engine), the stream is read by the receive loop only.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use crate::error::{ClientError, ClientResult};

pub type BoxFrameSink = Box<dyn FrameSink>;
pub type BoxFrameStream = Box<dyn FrameStream>;

/// Opens channels to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> ClientResult<(BoxFrameSink, BoxFrameStream)>;
}

/// Writing half of a channel
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete text frame
    async fn send(&mut self, frame: String) -> ClientResult<()>;

    /// Close the channel gracefully
    async fn close(&mut self) -> ClientResult<()>;
}

/// Reading half of a channel
#[async_trait]
pub trait FrameStream: Send {
    /// Next complete text frame, `None` once the remote closed the channel
    async fn next_frame(&mut self) -> Option<ClientResult<String>>;
}

// =============================================================================
// tokio-tungstenite transport
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, endpoint: &Url) -> ClientResult<(BoxFrameSink, BoxFrameStream)> {
        let (ws_stream, response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| ClientError::Transport(format!("Connect failed: {}", e)))?;
        debug!(endpoint = %endpoint, status = %response.status(), "WebSocket channel opened");

        let (write, read) = ws_stream.split();
        Ok((
            Box::new(TungsteniteSink { write }),
            Box::new(TungsteniteStream { read }),
        ))
    }
}

struct TungsteniteSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: String) -> ClientResult<()> {
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|e| ClientError::Transport(format!("Send failed: {}", e)))
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.write
            .close()
            .await
            .map_err(|e| ClientError::Transport(format!("Close failed: {}", e)))
    }
}

struct TungsteniteStream {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<ClientResult<String>> {
        loop {
            let msg = match self.read.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ClientError::Transport(format!("Receive error: {}", e)))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(data) => {
                    return Some(String::from_utf8(data).map_err(|e| {
                        ClientError::Serialization(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Message::Close(frame) => {
                    debug!(?frame, "Close frame received");
                    return None;
                }
                other => {
                    // Ping/Pong control frames are answered by tungstenite itself
                    trace!(?other, "Skipping control frame");
                }
            }
        }
    }
}
