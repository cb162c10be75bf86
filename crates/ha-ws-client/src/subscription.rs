//! Event subscription registry
//!
//! Local handlers are multiplexed onto at most one server-side
//! subscription per event filter. Inbound `event` messages are routed by
//! their subscription id and handed to every handler of that subscription
//! in registration order.
//!
//! Besides `subscribe_events` subscriptions (keyed by [`EventType`]), the
//! registry also tracks routes of commands whose server side pushes events
//! under the command's own id (long-running and temporary subscriptions).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ha_core::EventType;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};
use crate::message::EventMessage;

/// Identifier of a registered event handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandlerId(u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Callback = Arc<dyn Fn(&EventMessage) + Send + Sync>;
type LastEventPredicate = Arc<dyn Fn(&EventMessage) -> bool + Send + Sync>;

// =============================================================================
// Handlers
// =============================================================================

/// A local listener for events of one subscription
#[derive(Clone)]
pub enum EventHandler {
    /// Invoked on the receive loop for every event; must not block
    Callback(Callback),
    /// Feeds an unbounded [`EventQueue`]
    Queue(mpsc::UnboundedSender<ClientResult<EventMessage>>),
}

impl EventHandler {
    /// Handler invoking `f` for every event
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        EventHandler::Callback(Arc::new(f))
    }

    /// Handler feeding a queue, and the queue it feeds
    pub fn queue() -> (Self, EventQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventHandler::Queue(tx),
            EventQueue {
                rx,
                last_error: None,
            },
        )
    }

    fn deliver(&self, event: &EventMessage) {
        match self {
            EventHandler::Callback(f) => f(event),
            EventHandler::Queue(tx) => {
                if tx.send(Ok(event.clone())).is_err() {
                    trace!(id = event.id, "Event queue consumer is gone");
                }
            }
        }
    }

    fn fail(&self, reason: &ClientError) {
        if let EventHandler::Queue(tx) = self {
            let _ = tx.send(Err(reason.clone()));
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventHandler::Callback(_) => f.write_str("EventHandler::Callback"),
            EventHandler::Queue(_) => f.write_str("EventHandler::Queue"),
        }
    }
}

/// Ordered queue of events for one handler
///
/// Enqueueing never blocks the receive loop. When the subscription ends
/// with an error (connection lost, client disposed) the error is stored and
/// returned by every later read instead of leaving the reader waiting.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<ClientResult<EventMessage>>,
    last_error: Option<ClientError>,
}

impl EventQueue {
    /// Next event; `Ok(None)` once the handler has been removed
    pub async fn next_event(&mut self) -> ClientResult<Option<EventMessage>> {
        if let Some(err) = &self.last_error {
            return Err(err.clone());
        }
        match self.rx.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => {
                self.last_error = Some(err.clone());
                Err(err)
            }
            None => Ok(None),
        }
    }

    /// Next event if one is already queued
    pub fn try_next_event(&mut self) -> ClientResult<Option<EventMessage>> {
        if let Some(err) = &self.last_error {
            return Err(err.clone());
        }
        match self.rx.try_recv() {
            Ok(Ok(event)) => Ok(Some(event)),
            Ok(Err(err)) => {
                self.last_error = Some(err.clone());
                Err(err)
            }
            Err(_) => Ok(None),
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Local aggregation of handlers sharing one server-side registration
pub(crate) struct Subscription {
    filter: Option<EventType>,
    subscription_id: Option<u64>,
    handlers: IndexMap<HandlerId, EventHandler>,
    long_running: bool,
    is_last: Option<LastEventPredicate>,
}

impl Subscription {
    /// `subscribe_events` registration for `filter`
    pub(crate) fn for_events(filter: EventType, id: HandlerId, handler: EventHandler) -> Self {
        Self::with_handler(Some(filter), id, handler, true, None)
    }

    /// Command pushing events under its own id until unsubscribed
    pub(crate) fn long_running(id: HandlerId, handler: EventHandler) -> Self {
        Self::with_handler(None, id, handler, true, None)
    }

    /// Command pushing events until `is_last` flags one of them
    pub(crate) fn temporary<F>(id: HandlerId, handler: EventHandler, is_last: F) -> Self
    where
        F: Fn(&EventMessage) -> bool + Send + Sync + 'static,
    {
        Self::with_handler(None, id, handler, false, Some(Arc::new(is_last)))
    }

    fn with_handler(
        filter: Option<EventType>,
        id: HandlerId,
        handler: EventHandler,
        long_running: bool,
        is_last: Option<LastEventPredicate>,
    ) -> Self {
        let mut handlers = IndexMap::new();
        handlers.insert(id, handler);
        Self {
            filter,
            subscription_id: None,
            handlers,
            long_running,
            is_last,
        }
    }

    fn fail_all(&self, reason: &ClientError) {
        for handler in self.handlers.values() {
            handler.fail(reason);
        }
    }

    /// Fail queue handlers and drop them; callbacks stay registered
    fn drop_queues(&mut self, reason: &ClientError) {
        self.handlers.retain(|_, handler| match handler {
            EventHandler::Queue(_) => {
                handler.fail(reason);
                false
            }
            EventHandler::Callback(_) => true,
        });
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            subscription_id: self.subscription_id,
            event_type: self.filter.clone(),
            long_running: self.long_running,
            handlers: self.handlers.len(),
        }
    }
}

/// Snapshot of one registered subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    /// Server-side id, `None` while awaiting acknowledgement or after the connection was lost
    pub subscription_id: Option<u64>,
    /// Event filter of a `subscribe_events` registration
    pub event_type: Option<EventType>,
    pub long_running: bool,
    pub handlers: usize,
}

/// What removing a handler requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    /// No such handler
    NotFound,
    /// Removed locally, nothing to tell the hub
    Removed,
    /// Last handler of an active server subscription; unsubscribe first
    Unsubscribe(u64),
}

enum Route {
    /// Active `subscribe_events` registration, stored under its filter
    Filter(EventType),
    /// Awaiting acknowledgement, or a command subscription
    Direct(Subscription),
}

// =============================================================================
// Registry
// =============================================================================

pub(crate) struct EventSubscriptionRegistry {
    inner: Mutex<RegistryState>,
    next_handler_id: AtomicU64,
}

struct RegistryState {
    generation: u64,
    by_filter: HashMap<EventType, Subscription>,
    routes: HashMap<u64, Route>,
    closed: Option<ClientError>,
}

impl EventSubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                generation: 0,
                by_filter: HashMap::new(),
                routes: HashMap::new(),
                closed: Some(ClientError::InvalidOperation("client is not connected")),
            }),
            next_handler_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Accept routes for a new session
    pub(crate) fn open(&self, generation: u64) -> ClientResult<()> {
        let mut state = self.lock();
        if state.closed == Some(ClientError::Disposed) {
            return Err(ClientError::Disposed);
        }
        state.generation = generation;
        state.closed = None;
        Ok(())
    }

    /// Drop every server-side id after the session ended
    ///
    /// `subscribe_events` callbacks stay registered under their filter; a
    /// later `add_event_handler` for the filter subscribes again. Queue
    /// handlers receive `reason` and are dropped, since their reader only
    /// ever sees that error from then on. Command subscriptions are discarded.
    pub(crate) fn connection_lost(&self, reason: ClientError) {
        let mut state = self.lock();
        if state.closed != Some(ClientError::Disposed) {
            state.closed = Some(reason.clone());
        }
        for (_, route) in state.routes.drain() {
            if let Route::Direct(subscription) = route {
                subscription.fail_all(&reason);
            }
        }
        for subscription in state.by_filter.values_mut() {
            subscription.subscription_id = None;
            subscription.drop_queues(&reason);
        }
        state
            .by_filter
            .retain(|_, subscription| !subscription.handlers.is_empty());
        debug!(
            stale = state.by_filter.len(),
            "Server subscriptions invalidated"
        );
    }

    /// Fail and forget everything, permanently
    pub(crate) fn dispose(&self) {
        let mut state = self.lock();
        state.closed = Some(ClientError::Disposed);
        for (_, route) in state.routes.drain() {
            if let Route::Direct(subscription) = route {
                subscription.fail_all(&ClientError::Disposed);
            }
        }
        for (_, subscription) in state.by_filter.drain() {
            subscription.fail_all(&ClientError::Disposed);
        }
    }

    /// Add `handler` to the active subscription for `filter`
    ///
    /// Hands the handler back when there is no active server subscription
    /// for the filter yet.
    pub(crate) fn attach(
        &self,
        filter: &EventType,
        id: HandlerId,
        handler: EventHandler,
    ) -> ClientResult<Option<EventHandler>> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        match state.by_filter.get_mut(filter) {
            Some(subscription) if subscription.subscription_id.is_some() => {
                subscription.handlers.insert(id, handler);
                debug!(event_type = %filter, handler = %id, "Handler added to existing subscription");
                Ok(None)
            }
            _ => Ok(Some(handler)),
        }
    }

    /// Route events for command `id` to `subscription` until the guard is settled
    pub(crate) fn insert_route(
        self: &Arc<Self>,
        generation: u64,
        id: u64,
        subscription: Subscription,
    ) -> ClientResult<PendingRoute> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if state.generation != generation {
            return Err(ClientError::ConnectionLost);
        }
        state.routes.insert(id, Route::Direct(subscription));
        Ok(PendingRoute {
            registry: Arc::clone(self),
            generation,
            id,
            armed: true,
        })
    }

    /// Turn an acknowledged `subscribe_events` route into a filter subscription
    fn activate(&self, generation: u64, id: u64) -> ClientResult<()> {
        let mut state = self.lock();
        if state.generation != generation {
            return Err(ClientError::ConnectionLost);
        }
        let mut subscription = match state.routes.remove(&id) {
            Some(Route::Direct(subscription)) => subscription,
            Some(route) => {
                state.routes.insert(id, route);
                return Ok(());
            }
            None => return Err(ClientError::ConnectionLost),
        };
        let Some(filter) = subscription.filter.clone() else {
            subscription.subscription_id = Some(id);
            state.routes.insert(id, Route::Direct(subscription));
            return Ok(());
        };

        match state.by_filter.get_mut(&filter) {
            Some(existing) => {
                existing.subscription_id = Some(id);
                existing.handlers.extend(subscription.handlers.drain(..));
            }
            None => {
                subscription.subscription_id = Some(id);
                state.by_filter.insert(filter.clone(), subscription);
            }
        }
        debug!(id, event_type = %filter, "Subscribed to events");
        state.routes.insert(id, Route::Filter(filter));
        Ok(())
    }

    fn acknowledge(&self, generation: u64, id: u64) -> ClientResult<()> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if state.generation != generation {
            return Err(ClientError::ConnectionLost);
        }
        // Gone already when the last event arrived with the result
        if let Some(Route::Direct(subscription)) = state.routes.get_mut(&id) {
            subscription.subscription_id = Some(id);
        }
        Ok(())
    }

    fn discard_route(&self, generation: u64, id: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.routes.remove(&id).is_some() {
            debug!(id, "Route discarded");
        }
    }

    /// Work out what removing `handler` from `filter` takes
    ///
    /// Non-last handlers and handlers of a subscription whose server id was
    /// lost are removed right away.
    pub(crate) fn plan_removal(&self, filter: &EventType, handler: HandlerId) -> Removal {
        let mut state = self.lock();
        let Some(subscription) = state.by_filter.get_mut(filter) else {
            return Removal::NotFound;
        };
        if !subscription.handlers.contains_key(&handler) {
            return Removal::NotFound;
        }
        match subscription.subscription_id {
            Some(id) if subscription.handlers.len() == 1 => Removal::Unsubscribe(id),
            _ => {
                subscription.handlers.shift_remove(&handler);
                if subscription.handlers.is_empty() {
                    state.by_filter.remove(filter);
                }
                debug!(event_type = %filter, handler = %handler, "Handler removed");
                Removal::Removed
            }
        }
    }

    /// Remove `handler` once the hub confirmed `unsubscribe_events`
    pub(crate) fn finish_removal(&self, filter: &EventType, handler: HandlerId, id: u64) {
        let mut state = self.lock();
        if let Some(subscription) = state.by_filter.get_mut(filter) {
            subscription.handlers.shift_remove(&handler);
            if subscription.handlers.is_empty() {
                state.by_filter.remove(filter);
            }
        }
        if matches!(state.routes.get(&id), Some(Route::Filter(f)) if f == filter) {
            state.routes.remove(&id);
        }
        debug!(id, event_type = %filter, "Unsubscribed from events");
    }

    /// Whether `id` is an active command subscription
    pub(crate) fn has_command_subscription(&self, id: u64) -> bool {
        matches!(
            self.lock().routes.get(&id),
            Some(Route::Direct(subscription)) if subscription.subscription_id.is_some()
        )
    }

    /// Forget command subscription `id`; its queue handlers see the end of the stream
    pub(crate) fn remove_command_subscription(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.routes.get(&id) {
            Some(Route::Direct(_)) => {
                state.routes.remove(&id);
                debug!(id, "Command subscription removed");
                true
            }
            _ => false,
        }
    }

    /// Hand an inbound event to the handlers of its subscription
    ///
    /// Handlers run after the table lock is released.
    pub(crate) fn on_event(&self, event: &EventMessage) {
        let handlers: Vec<EventHandler> = {
            let mut state = self.lock();
            let (handlers, finished) = match state.routes.get(&event.id) {
                Some(Route::Filter(filter)) => {
                    let handlers = state
                        .by_filter
                        .get(filter)
                        .map(|s| s.handlers.values().cloned().collect())
                        .unwrap_or_default();
                    trace!(id = event.id, event_type = %filter, "Dispatching event");
                    (handlers, false)
                }
                Some(Route::Direct(subscription)) => {
                    let handlers = subscription.handlers.values().cloned().collect();
                    let finished = !subscription.long_running
                        && subscription.is_last.as_ref().is_some_and(|f| f(event));
                    trace!(id = event.id, "Dispatching command event");
                    (handlers, finished)
                }
                None => {
                    debug!(id = event.id, "Discarding event for unknown subscription");
                    return;
                }
            };
            if finished {
                state.routes.remove(&event.id);
                debug!(id = event.id, "Temporary subscription finished");
            }
            handlers
        };

        for handler in &handlers {
            handler.deliver(event);
        }
    }

    /// Number of registered local handlers
    pub(crate) fn handlers_count(&self) -> usize {
        let state = self.lock();
        let by_filter: usize = state.by_filter.values().map(|s| s.handlers.len()).sum();
        let direct: usize = state
            .routes
            .values()
            .map(|route| match route {
                Route::Direct(subscription) => subscription.handlers.len(),
                Route::Filter(_) => 0,
            })
            .sum();
        by_filter + direct
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let state = self.lock();
        let mut infos: Vec<SubscriptionInfo> =
            state.by_filter.values().map(Subscription::info).collect();
        infos.extend(state.routes.values().filter_map(|route| match route {
            Route::Direct(subscription) => Some(subscription.info()),
            Route::Filter(_) => None,
        }));
        infos.sort_by_key(|info| info.subscription_id);
        infos
    }
}

/// A route inserted before its command was written
///
/// Dropping the guard before it is settled removes the route, so a failed
/// or cancelled subscription leaves nothing behind.
pub(crate) struct PendingRoute {
    registry: Arc<EventSubscriptionRegistry>,
    generation: u64,
    id: u64,
    armed: bool,
}

impl PendingRoute {
    /// Settle an acknowledged `subscribe_events` route
    pub(crate) fn activate(mut self) -> ClientResult<()> {
        self.armed = false;
        self.registry.activate(self.generation, self.id)
    }

    /// Record the acknowledgement of a temporary subscription
    ///
    /// The guard stays armed: the route is removed when it is dropped,
    /// unless the last event removed it first.
    pub(crate) fn acknowledge(&self) -> ClientResult<()> {
        self.registry.acknowledge(self.generation, self.id)
    }

    /// Settle an acknowledged command subscription, returning its id
    pub(crate) fn keep(mut self) -> ClientResult<u64> {
        self.armed = false;
        self.registry.activate(self.generation, self.id)?;
        Ok(self.id)
    }
}

impl Drop for PendingRoute {
    fn drop(&mut self) {
        if self.armed {
            self.registry.discard_route(self.generation, self.id);
        }
    }
}
