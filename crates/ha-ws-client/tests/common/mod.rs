//! In-memory hub for session tests
//!
//! [`MockConnector`] hands the client one end of an in-memory channel per
//! connect; the test drives the other end ([`ServerEnd`]) and plays the hub.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ha_ws_client::transport::{BoxFrameSink, BoxFrameStream};
use ha_ws_client::{
    CancellationToken, ClientConfig, ClientError, ClientResult, ConnectionParameters, Connector,
    FrameSink, FrameStream, WsClient,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

pub const HA_VERSION: &str = "2024.3.0";
pub const TOKEN: &str = "test-token";

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn params() -> ConnectionParameters {
    ConnectionParameters::new("ws://hub.test/api/websocket", TOKEN).expect("valid parameters")
}

/// Await `fut`, failing the test instead of hanging
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .expect("step timed out")
}

// =============================================================================
// Connector
// =============================================================================

pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl MockConnector {
    /// Refuse the next `n` connect attempts with a transport error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &Url) -> ClientResult<(BoxFrameSink, BoxFrameStream)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ClientError::Transport("connection refused".to_string()));
        }

        let (to_hub, from_client) = mpsc::unbounded_channel();
        let (to_client, from_hub) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerEnd {
                rx: from_client,
                tx: Some(to_client),
            })
            .map_err(|_| ClientError::Transport("hub is gone".to_string()))?;

        Ok((
            Box::new(MockSink { tx: Some(to_hub) }),
            Box::new(MockStream { rx: from_hub }),
        ))
    }
}

struct MockSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: String) -> ClientResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ClientError::Transport("channel closed".to_string()))?;
        tx.send(frame)
            .map_err(|_| ClientError::Transport("hub hung up".to_string()))
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.tx = None;
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<ClientResult<String>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next_frame(&mut self) -> Option<ClientResult<String>> {
        self.rx.recv().await
    }
}

// =============================================================================
// Hub side
// =============================================================================

pub struct MockHub {
    pub connector: Arc<MockConnector>,
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MockHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(MockConnector {
                accepted: tx,
                failures: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
            }),
            accepted: rx,
        }
    }

    pub fn client(&self) -> Arc<WsClient> {
        self.client_with(ClientConfig::default())
    }

    pub fn client_with(&self, config: ClientConfig) -> Arc<WsClient> {
        Arc::new(WsClient::with_config(self.connector.clone(), config))
    }

    /// Next channel opened by a client
    pub async fn accept(&mut self) -> ServerEnd {
        within(self.accepted.recv())
            .await
            .expect("connector dropped")
    }
}

/// The hub's end of one channel
pub struct ServerEnd {
    rx: mpsc::UnboundedReceiver<String>,
    tx: Option<mpsc::UnboundedSender<ClientResult<String>>>,
}

impl ServerEnd {
    pub fn send(&self, message: Value) {
        self.send_raw(message.to_string());
    }

    pub fn send_raw(&self, frame: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(frame));
        }
    }

    /// Make the client's next read fail
    pub fn send_read_error(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(ClientError::Transport("connection reset".to_string())));
        }
    }

    /// Close the channel from the hub side
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    /// Next frame written by the client
    pub async fn recv(&mut self) -> Value {
        let frame = within(self.rx.recv())
            .await
            .expect("client closed the channel");
        serde_json::from_str(&frame).expect("client sent invalid JSON")
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx
            .try_recv()
            .ok()
            .map(|frame| serde_json::from_str(&frame).expect("client sent invalid JSON"))
    }

    /// Whether the client dropped or closed its end
    pub async fn closed(&mut self) -> bool {
        within(self.rx.recv()).await.is_none()
    }

    pub fn auth_required(&self) {
        self.send(json!({"type": "auth_required", "ha_version": HA_VERSION}));
    }

    pub async fn expect_auth(&mut self) {
        assert_eq!(
            self.recv().await,
            json!({"type": "auth", "access_token": TOKEN})
        );
    }

    pub async fn handshake(&mut self) {
        self.auth_required();
        self.expect_auth().await;
        self.send(json!({"type": "auth_ok", "ha_version": HA_VERSION}));
    }

    pub fn result(&self, id: &Value, result: Value) {
        self.send(json!({"id": id, "type": "result", "success": true, "result": result}));
    }

    pub fn failure(&self, id: &Value, code: &str, message: &str) {
        self.send(json!({
            "id": id,
            "type": "result",
            "success": false,
            "error": {"code": code, "message": message}
        }));
    }

    pub fn event(&self, id: &Value, event: Value) {
        self.send(json!({"id": id, "type": "event", "event": event}));
    }

    /// Receive the next frame, check its type and acknowledge it
    pub async fn ack(&mut self, command_type: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["type"], command_type, "unexpected frame {}", frame);
        self.result(&frame["id"], Value::Null);
        frame
    }

    /// Answer the next frame, which must be a ping
    pub async fn pong(&mut self) {
        let frame = self.recv().await;
        assert_eq!(frame["type"], "ping", "unexpected frame {}", frame);
        self.send(json!({"id": frame["id"], "type": "pong"}));
    }
}

/// A hub and a client connected to it
pub async fn connected() -> (MockHub, Arc<WsClient>, ServerEnd) {
    connected_with(ClientConfig::default()).await
}

pub async fn connected_with(config: ClientConfig) -> (MockHub, Arc<WsClient>, ServerEnd) {
    let mut hub = MockHub::new();
    let client = hub.client_with(config);
    let server = connect(&mut hub, &client).await;
    (hub, client, server)
}

/// Connect `client` and play the hub's side of the handshake
pub async fn connect(hub: &mut MockHub, client: &WsClient) -> ServerEnd {
    let cancel = CancellationToken::new();
    let params = params();
    let (result, server) = tokio::join!(within(client.connect(&params, &cancel)), async {
        let mut server = hub.accept().await;
        server.handshake().await;
        server
    });
    result.expect("connect failed");
    server
}
