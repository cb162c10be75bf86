//! Connection controller
//!
//! [`WsClient`] owns the connection lifecycle: it drives the
//! `auth_required` / `auth` / `auth_ok` handshake, publishes every state
//! change, and runs the single receive loop that classifies inbound frames
//! and routes results to the dispatcher and events to the registry.
//!
//! All outbound frames of a session go through one sink behind an async
//! mutex. The correlation id is allocated while that mutex is held, so ids
//! reach the hub in increasing order.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ha_core::{CalVer, EventType};
use tokio::sync::{broadcast, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConnectionParameters};
use crate::dispatcher::{PendingResponse, RequestDispatcher};
use crate::error::{ClientError, ClientResult};
use crate::message::{
    self, CommandResult, ErrorCode, EventMessage, IncomingMessage, OutgoingMessage, RawCommand,
};
use crate::state::ConnectionState;
use crate::subscription::{
    EventHandler, EventSubscriptionRegistry, HandlerId, Removal, Subscription, SubscriptionInfo,
};
use crate::transport::{BoxFrameSink, BoxFrameStream, Connector, TungsteniteConnector};

type SharedSink = Arc<AsyncMutex<BoxFrameSink>>;

const NOT_CONNECTED: &str = "client is not connected";

/// Client session with a Home Assistant hub
///
/// One instance handles one connection at a time. After [`close`] or a
/// lost connection it can [`connect`] again; after [`dispose`] (or drop)
/// every operation fails with [`ClientError::Disposed`].
///
/// [`close`]: WsClient::close
/// [`connect`]: WsClient::connect
/// [`dispose`]: WsClient::dispose
pub struct WsClient {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    cell: Mutex<SessionCell>,
    state_tx: broadcast::Sender<ConnectionState>,
    dispatcher: Arc<RequestDispatcher>,
    registry: Arc<EventSubscriptionRegistry>,
    /// Serializes adding and removing event handlers
    handler_ops: AsyncMutex<()>,
}

#[derive(Default)]
struct SessionCell {
    state: ConnectionState,
    /// Incremented by every connect attempt
    generation: u64,
    session: Option<Session>,
    ha_version: Option<CalVer>,
    disposed: bool,
}

struct Session {
    cancel: CancellationToken,
    sink: Option<SharedSink>,
}

struct Handshake {
    sink: BoxFrameSink,
    stream: BoxFrameStream,
    ha_version: Option<String>,
}

impl WsClient {
    /// Client opening channels through `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_config(connector, ClientConfig::default())
    }

    pub fn with_config(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let (state_tx, _) = broadcast::channel(config.state_channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                cell: Mutex::new(SessionCell::default()),
                state_tx,
                dispatcher: Arc::new(RequestDispatcher::new()),
                registry: Arc::new(EventSubscriptionRegistry::new()),
                handler_ops: AsyncMutex::new(()),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a channel and authenticate
    ///
    /// Fails with [`ClientError::InvalidOperation`] unless the client is
    /// disconnected. Cancelling `cancel` (or calling [`WsClient::close`])
    /// while the handshake is in progress aborts it with
    /// [`ClientError::Cancelled`]; cancelling after it completed has no effect.
    pub async fn connect(
        &self,
        params: &ConnectionParameters,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.inner.connect(params, cancel).await
    }

    /// Close the connection
    ///
    /// Outstanding requests fail with [`ClientError::ConnectionLost`]. A
    /// no-op when already disconnected; a token cancelled before the call
    /// leaves the connection untouched and returns [`ClientError::Cancelled`].
    pub async fn close(&self, cancel: &CancellationToken) -> ClientResult<()> {
        self.inner.close(cancel).await
    }

    /// Permanently shut the client down
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock_cell().disposed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock_cell().state
    }

    /// Receiver for every state transition from now on
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Version reported by the hub during the handshake
    pub fn ha_version(&self) -> Option<CalVer> {
        self.inner.lock_cell().ha_version.clone()
    }

    /// Wait for a connect in progress to finish
    ///
    /// Returns `true` once the client is connected and `false` when no
    /// connect is in progress or the attempt ends disconnected. Fails with
    /// [`ClientError::Timeout`] when `timeout` elapses first.
    pub async fn wait_for_connection(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ClientResult<bool> {
        let mut changes = {
            let cell = self.inner.lock_cell();
            if cell.disposed {
                return Err(ClientError::Disposed);
            }
            match cell.state {
                ConnectionState::Connected => return Ok(true),
                ConnectionState::Disconnected => return Ok(false),
                // Transitions are published under the cell lock
                _ => self.inner.state_tx.subscribe(),
            }
        };

        let settled = async {
            loop {
                let state = match changes.recv().await {
                    Ok(state) => state,
                    Err(broadcast::error::RecvError::Lagged(_)) => self.connection_state(),
                    Err(broadcast::error::RecvError::Closed) => return false,
                };
                match state {
                    ConnectionState::Connected => return true,
                    ConnectionState::Disconnected => return false,
                    _ => {}
                }
            }
        };
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            connected = settled => Ok(connected),
            _ = deadline => Err(ClientError::Timeout),
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Send a command and wait for its result
    ///
    /// A failed result is returned as `Ok` with `success == false`; use
    /// [`CommandResult::into_result`] to turn it into an error.
    pub async fn send_command(
        &self,
        command: &RawCommand,
        cancel: &CancellationToken,
    ) -> ClientResult<CommandResult> {
        let (pending, ()) = self
            .inner
            .write_request(cancel, |id| command.to_frame(id), |_, _| Ok(()))
            .await?;
        pending.wait(cancel).await
    }

    /// Round trip time of a `ping`
    pub async fn ping(&self, cancel: &CancellationToken) -> ClientResult<Duration> {
        let started = Instant::now();
        let (pending, ()) = self
            .inner
            .write_request(
                cancel,
                |id| OutgoingMessage::Ping { id }.to_frame(),
                |_, _| Ok(()),
            )
            .await?;
        pending.wait(cancel).await?;
        Ok(started.elapsed())
    }

    pub fn pending_requests_count(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    // =========================================================================
    // Event subscriptions
    // =========================================================================

    /// Register `handler` for events of `event_type`
    ///
    /// The first handler for a type subscribes on the hub; later handlers
    /// share that subscription. Pass [`EventType::match_all`] for all events.
    pub async fn add_event_handler(
        &self,
        event_type: impl Into<EventType>,
        handler: EventHandler,
        cancel: &CancellationToken,
    ) -> ClientResult<HandlerId> {
        let filter = event_type.into();
        let inner = &self.inner;
        inner.ensure_connected(cancel)?;
        let _ops = inner.lock_handler_ops(cancel).await?;

        let handler_id = inner.registry.next_handler_id();
        let Some(handler) = inner.registry.attach(&filter, handler_id, handler)? else {
            return Ok(handler_id);
        };

        let command = message::subscribe_events(&filter);
        let subscription = Subscription::for_events(filter.clone(), handler_id, handler);
        let (pending, route) = inner
            .write_request(
                cancel,
                |id| command.to_frame(id),
                |generation, id| inner.registry.insert_route(generation, id, subscription),
            )
            .await?;
        pending.wait(cancel).await?.into_result()?;
        route.activate()?;
        Ok(handler_id)
    }

    /// Unregister a handler
    ///
    /// The last handler of a type unsubscribes on the hub first; if the hub
    /// rejects that, the handler stays registered. Returns `false` for an
    /// unknown handler.
    pub async fn remove_event_handler(
        &self,
        event_type: impl Into<EventType>,
        handler: HandlerId,
        cancel: &CancellationToken,
    ) -> ClientResult<bool> {
        let filter = event_type.into();
        let inner = &self.inner;
        inner.ensure_connected(cancel)?;
        let _ops = inner.lock_handler_ops(cancel).await?;

        match inner.registry.plan_removal(&filter, handler) {
            Removal::NotFound => Ok(false),
            Removal::Removed => Ok(true),
            Removal::Unsubscribe(subscription_id) => {
                let result = self
                    .send_command(&message::unsubscribe_events(subscription_id), cancel)
                    .await?;
                match result.into_result() {
                    Ok(_) => {}
                    Err(ClientError::Remote(info)) if info.code == ErrorCode::NotFound => {
                        debug!(id = subscription_id, "Hub no longer knows the subscription");
                    }
                    Err(err) => return Err(err),
                }
                inner
                    .registry
                    .finish_removal(&filter, handler, subscription_id);
                Ok(true)
            }
        }
    }

    /// Send a command whose server side keeps pushing events under its id
    ///
    /// Returns the subscription id to pass to [`WsClient::unsubscribe`].
    pub async fn subscribe(
        &self,
        command: &RawCommand,
        handler: EventHandler,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        let inner = &self.inner;
        let subscription = Subscription::long_running(inner.registry.next_handler_id(), handler);
        let (pending, route) = inner
            .write_request(
                cancel,
                |id| command.to_frame(id),
                |generation, id| inner.registry.insert_route(generation, id, subscription),
            )
            .await?;
        pending.wait(cancel).await?.into_result()?;
        let id = route.keep()?;
        debug!(id, command_type = command.command_type(), "Subscription established");
        Ok(id)
    }

    /// End a subscription made with [`WsClient::subscribe`]
    pub async fn unsubscribe(
        &self,
        subscription_id: u64,
        cancel: &CancellationToken,
    ) -> ClientResult<bool> {
        self.inner.ensure_connected(cancel)?;
        if !self.inner.registry.has_command_subscription(subscription_id) {
            return Ok(false);
        }
        self.send_command(&message::unsubscribe_events(subscription_id), cancel)
            .await?
            .into_result()?;
        Ok(self
            .inner
            .registry
            .remove_command_subscription(subscription_id))
    }

    /// Send a command and collect the events it pushes until `is_last` flags one
    pub async fn subscribe_temporary<F>(
        &self,
        command: &RawCommand,
        is_last: F,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<EventMessage>>
    where
        F: Fn(&EventMessage) -> bool + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let (handler, mut queue) = EventHandler::queue();
        let subscription =
            Subscription::temporary(inner.registry.next_handler_id(), handler, is_last);
        let (pending, route) = inner
            .write_request(
                cancel,
                |id| command.to_frame(id),
                |generation, id| inner.registry.insert_route(generation, id, subscription),
            )
            .await?;
        pending.wait(cancel).await?.into_result()?;
        // The route stays guarded until the collection below ends
        route.acknowledge()?;

        let mut events = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                next = queue.next_event() => next?,
            };
            match next {
                Some(event) => events.push(event),
                None => break,
            }
        }
        Ok(events)
    }

    /// Number of registered local event handlers
    pub fn subscriptions_count(&self) -> usize {
        self.inner.registry.handlers_count()
    }

    pub fn registered_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.registry.snapshot()
    }
}

impl Default for WsClient {
    fn default() -> Self {
        Self::new(Arc::new(TungsteniteConnector))
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.inner.lock_cell();
        f.debug_struct("WsClient")
            .field("state", &cell.state)
            .field("ha_version", &cell.ha_version)
            .field("disposed", &cell.disposed)
            .finish()
    }
}

// =============================================================================
// Session handling
// =============================================================================

impl Inner {
    fn lock_cell(&self) -> MutexGuard<'_, SessionCell> {
        self.cell.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, cell: &mut SessionCell, to: ConnectionState) {
        match cell.state.try_transition(to) {
            Ok(next) => {
                cell.state = next;
                debug!(state = %next, "Connection state changed");
                // No receivers is fine
                let _ = self.state_tx.send(next);
            }
            Err(err) => warn!(error = %err, "Ignoring state change"),
        }
    }

    async fn connect(
        self: &Arc<Self>,
        params: &ConnectionParameters,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        let (generation, session_cancel) = {
            let mut cell = self.lock_cell();
            if cell.disposed {
                return Err(ClientError::Disposed);
            }
            if cell.state != ConnectionState::Disconnected {
                return Err(ClientError::InvalidOperation(
                    "connect requires a disconnected client",
                ));
            }
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            cell.generation += 1;
            let session_cancel = CancellationToken::new();
            cell.session = Some(Session {
                cancel: session_cancel.clone(),
                sink: None,
            });
            cell.ha_version = None;
            self.transition(&mut cell, ConnectionState::Connecting);
            (cell.generation, session_cancel)
        };
        info!(endpoint = %params.endpoint(), "Connecting");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = session_cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.handshake_with_retries(params, generation) => result,
        };

        let err = match outcome.and_then(|handshake| self.install(generation, handshake)) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let mut cell = self.lock_cell();
        if cell.generation == generation {
            self.teardown_locked(&mut cell, ClientError::ConnectionLost);
        }
        if cell.disposed {
            return Err(ClientError::Disposed);
        }
        warn!(error = %err, "Connect failed");
        Err(err)
    }

    async fn handshake_with_retries(
        &self,
        params: &ConnectionParameters,
        generation: u64,
    ) -> ClientResult<Handshake> {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::time::timeout(
                self.config.handshake_timeout(),
                self.handshake(params, generation),
            )
            .await
            .unwrap_or(Err(ClientError::Timeout));

            let err = match result {
                Ok(handshake) => return Ok(handshake),
                Err(err) => err,
            };
            let retries_left = self
                .config
                .connect_retries
                .map_or(true, |max| attempt < max);
            let still_connecting = self.lock_cell().state == ConnectionState::Connecting;
            if !err.is_retryable() || !retries_left || !still_connecting {
                return Err(err);
            }
            attempt += 1;
            warn!(error = %err, attempt, "Connect attempt failed, retrying");
            tokio::time::sleep(self.config.retry_interval()).await;
        }
    }

    async fn handshake(
        &self,
        params: &ConnectionParameters,
        generation: u64,
    ) -> ClientResult<Handshake> {
        let (mut sink, mut stream) = self.connector.connect(params.endpoint()).await?;

        let ha_version = match read_message(&mut stream).await? {
            IncomingMessage::AuthRequired { ha_version } => ha_version,
            other => {
                return Err(ClientError::UnexpectedMessage(format!(
                    "expected auth_required, got {}",
                    other.kind()
                )))
            }
        };
        self.enter_authenticating(generation)?;

        let auth = OutgoingMessage::Auth {
            access_token: params.access_token(),
        }
        .to_frame()?;
        sink.send(auth).await?;

        match read_message(&mut stream).await? {
            IncomingMessage::AuthOk {
                ha_version: confirmed,
            } => Ok(Handshake {
                sink,
                stream,
                ha_version: confirmed.or(ha_version),
            }),
            IncomingMessage::AuthInvalid { message } => {
                if let Err(err) = sink.close().await {
                    debug!(error = %err, "Closing the channel failed");
                }
                Err(ClientError::Authentication(
                    message.unwrap_or_else(|| "invalid access token".to_string()),
                ))
            }
            other => Err(ClientError::UnexpectedMessage(format!(
                "expected auth_ok, got {}",
                other.kind()
            ))),
        }
    }

    fn enter_authenticating(&self, generation: u64) -> ClientResult<()> {
        let mut cell = self.lock_cell();
        if cell.generation != generation || cell.state != ConnectionState::Connecting {
            return Err(ClientError::Cancelled);
        }
        self.transition(&mut cell, ConnectionState::Authenticating);
        Ok(())
    }

    /// Publish an authenticated channel as the current session
    fn install(self: &Arc<Self>, generation: u64, handshake: Handshake) -> ClientResult<()> {
        let Handshake {
            sink,
            stream,
            ha_version,
        } = handshake;

        let mut cell = self.lock_cell();
        if cell.disposed {
            return Err(ClientError::Disposed);
        }
        if cell.generation != generation || cell.state != ConnectionState::Authenticating {
            return Err(ClientError::Cancelled);
        }
        let Some(session) = cell.session.as_mut() else {
            return Err(ClientError::Cancelled);
        };
        session.sink = Some(Arc::new(AsyncMutex::new(sink)));
        let session_cancel = session.cancel.clone();

        self.dispatcher.open(generation)?;
        self.registry.open(generation)?;
        cell.ha_version = ha_version.as_deref().and_then(|raw| match raw.parse::<CalVer>() {
            Ok(version) => Some(version),
            Err(err) => {
                warn!(version = raw, error = %err, "Unrecognized hub version");
                None
            }
        });
        self.transition(&mut cell, ConnectionState::Connected);
        info!(
            ha_version = ha_version.as_deref().unwrap_or("unknown"),
            "Connected"
        );
        drop(cell);

        tokio::spawn(receive_loop(
            Arc::clone(self),
            generation,
            session_cancel,
            stream,
        ));
        Ok(())
    }

    /// Move to Disconnected and fail everything outstanding
    ///
    /// Returns the session's sink so that the caller can close it.
    fn teardown_locked(&self, cell: &mut SessionCell, reason: ClientError) -> Option<SharedSink> {
        if cell.state == ConnectionState::Disconnected {
            return None;
        }
        self.transition(cell, ConnectionState::Disconnected);
        cell.ha_version = None;
        self.dispatcher.close(reason.clone());
        self.registry.connection_lost(reason);

        let session = cell.session.take()?;
        session.cancel.cancel();
        session.sink
    }

    async fn close(&self, cancel: &CancellationToken) -> ClientResult<()> {
        let sink = {
            let mut cell = self.lock_cell();
            if cell.disposed {
                return Err(ClientError::Disposed);
            }
            if cell.state == ConnectionState::Disconnected {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            self.teardown_locked(&mut cell, ClientError::ConnectionLost)
        };
        info!("Connection closed");

        if let Some(sink) = sink {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => debug!("Graceful close abandoned"),
                _ = close_sink(sink) => {}
            }
        }
        Ok(())
    }

    fn dispose(&self) {
        let sink = {
            let mut cell = self.lock_cell();
            if cell.disposed {
                return;
            }
            cell.disposed = true;
            self.dispatcher.close(ClientError::Disposed);
            self.registry.dispose();
            self.teardown_locked(&mut cell, ClientError::Disposed)
        };
        info!("Client disposed");

        if let Some(sink) = sink {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(close_sink(sink));
            }
        }
    }

    /// Called by the receive loop when the channel failed or the hub closed it
    fn connection_lost(&self, generation: u64) {
        let mut cell = self.lock_cell();
        if cell.generation != generation || cell.state == ConnectionState::Disconnected {
            return;
        }
        info!("Connection lost");
        self.teardown_locked(&mut cell, ClientError::ConnectionLost);
    }

    fn ensure_connected(&self, cancel: &CancellationToken) -> ClientResult<(u64, SharedSink)> {
        let cell = self.lock_cell();
        if cell.disposed {
            return Err(ClientError::Disposed);
        }
        if cell.state != ConnectionState::Connected {
            return Err(ClientError::InvalidOperation(NOT_CONNECTED));
        }
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let sink = cell
            .session
            .as_ref()
            .and_then(|session| session.sink.clone())
            .ok_or(ClientError::InvalidOperation(NOT_CONNECTED))?;
        Ok((cell.generation, sink))
    }

    async fn lock_handler_ops(
        &self,
        cancel: &CancellationToken,
    ) -> ClientResult<AsyncMutexGuard<'_, ()>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            guard = self.handler_ops.lock() => Ok(guard),
        }
    }

    /// Register a request and write its frame
    ///
    /// `register` runs right after the id is allocated and before the frame
    /// is written, all under the sink lock. Nothing is registered when
    /// `cancel` fires before the write.
    async fn write_request<T>(
        &self,
        cancel: &CancellationToken,
        encode: impl FnOnce(u64) -> ClientResult<String>,
        register: impl FnOnce(u64, u64) -> ClientResult<T>,
    ) -> ClientResult<(PendingResponse, T)> {
        let (generation, shared) = self.ensure_connected(cancel)?;
        let mut writer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = shared.lock() => guard,
        };
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let pending = self.dispatcher.register(generation)?;
        let registered = register(generation, pending.id())?;
        let frame = encode(pending.id())?;
        debug!(id = pending.id(), "Sending request");
        writer.send(frame).await?;
        Ok((pending, registered))
    }

    fn route_frame(&self, frame: &str) {
        let message = match IncomingMessage::from_frame(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Discarding unparseable frame");
                return;
            }
        };
        debug!(kind = message.kind(), "Frame received");
        match message {
            IncomingMessage::Result(result) => self.dispatcher.on_result(result),
            IncomingMessage::Pong { id } => self.dispatcher.on_pong(id),
            IncomingMessage::Event(event) => self.registry.on_event(&event),
            other => warn!(
                kind = other.kind(),
                "Discarding handshake message on an established connection"
            ),
        }
    }
}

async fn read_message(stream: &mut BoxFrameStream) -> ClientResult<IncomingMessage> {
    match stream.next_frame().await {
        Some(frame) => IncomingMessage::from_frame(&frame?),
        None => Err(ClientError::ConnectionLost),
    }
}

async fn close_sink(sink: SharedSink) {
    let mut sink = sink.lock().await;
    if let Err(err) = sink.close().await {
        debug!(error = %err, "Closing the channel failed");
    }
}

/// Sole reader of the session's stream
async fn receive_loop(
    inner: Arc<Inner>,
    generation: u64,
    cancel: CancellationToken,
    mut stream: BoxFrameStream,
) {
    debug!(generation, "Receive loop started");
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(generation, "Receive loop stopped");
                return;
            }
            frame = stream.next_frame() => frame,
        };
        match frame {
            Some(Ok(frame)) => inner.route_frame(&frame),
            Some(Err(err)) => {
                warn!(error = %err, "Receiving failed");
                break;
            }
            None => {
                debug!("Hub closed the channel");
                break;
            }
        }
    }
    inner.connection_lost(generation);
}
