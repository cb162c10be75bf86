//! Request dispatcher
//!
//! Allocates correlation ids and matches inbound results to the commands
//! that are waiting for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{ClientError, ClientResult};
use crate::message::{CommandResult, ErrorCode, ResultMessage};

type Completion = oneshot::Sender<ClientResult<CommandResult>>;

/// Table of outstanding requests for the current session
pub(crate) struct RequestDispatcher {
    inner: Mutex<DispatcherState>,
}

struct DispatcherState {
    /// Session the table currently belongs to
    generation: u64,
    /// Last id handed out in this session; ids restart at 1 per session
    last_id: u64,
    pending: HashMap<u64, Completion>,
    /// Why new requests are refused, `None` while the session is open
    closed: Option<ClientError>,
}

impl RequestDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(DispatcherState {
                generation: 0,
                last_id: 0,
                pending: HashMap::new(),
                closed: Some(ClientError::InvalidOperation("client is not connected")),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept requests for a new session
    pub(crate) fn open(&self, generation: u64) -> ClientResult<()> {
        let mut state = self.lock();
        if state.closed == Some(ClientError::Disposed) {
            return Err(ClientError::Disposed);
        }
        state.generation = generation;
        state.last_id = 0;
        state.closed = None;
        Ok(())
    }

    /// Refuse new requests and fail every outstanding one with `reason`
    ///
    /// Once closed with [`ClientError::Disposed`] the dispatcher stays disposed.
    pub(crate) fn close(&self, reason: ClientError) {
        let drained: Vec<(u64, Completion)> = {
            let mut state = self.lock();
            if state.closed != Some(ClientError::Disposed) {
                state.closed = Some(reason.clone());
            }
            state.pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), reason = %reason, "Failing outstanding requests");
        }
        for (_, completion) in drained {
            let _ = completion.send(Err(reason.clone()));
        }
    }

    /// Allocate the next id and register a pending request under it
    ///
    /// The gate check and the insertion happen in one critical section.
    pub(crate) fn register(self: &Arc<Self>, generation: u64) -> ClientResult<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if state.generation != generation {
            return Err(ClientError::ConnectionLost);
        }
        state.last_id += 1;
        let id = state.last_id;
        state.pending.insert(id, tx);
        Ok(PendingResponse {
            id,
            generation,
            rx,
            dispatcher: Arc::clone(self),
        })
    }

    /// Complete the request a `result` message answers
    pub(crate) fn on_result(&self, result: ResultMessage) {
        if let Some(error) = result.error.as_ref().filter(|e| e.code == ErrorCode::IdReuse) {
            error!(id = result.id, message = %error.message, "Hub rejected a reused command id");
        }
        let id = result.id;
        self.complete(id, CommandResult::from(result));
    }

    /// Complete the ping a `pong` message answers
    pub(crate) fn on_pong(&self, id: u64) {
        self.complete(id, CommandResult::pong(id));
    }

    fn complete(&self, id: u64, result: CommandResult) {
        let completion = self.lock().pending.remove(&id);
        match completion {
            Some(completion) => {
                debug!(id, success = result.success, "Result matched");
                // The waiter may have been dropped in the meantime
                let _ = completion.send(Ok(result));
            }
            None => warn!(id, "Discarding result for unknown or cancelled request"),
        }
    }

    fn forget(&self, generation: u64, id: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.pending.remove(&id);
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// Handle on an outstanding request
///
/// Dropping the handle removes the request from the table.
pub(crate) struct PendingResponse {
    id: u64,
    generation: u64,
    rx: oneshot::Receiver<ClientResult<CommandResult>>,
    dispatcher: Arc<RequestDispatcher>,
}

impl PendingResponse {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the matching result, the cancellation signal or the end of the session
    pub(crate) async fn wait(mut self, cancel: &CancellationToken) -> ClientResult<CommandResult> {
        tokio::select! {
            biased;
            outcome = &mut self.rx => outcome.unwrap_or(Err(ClientError::ConnectionLost)),
            _ = cancel.cancelled() => {
                debug!(id = self.id, "Request cancelled");
                Err(ClientError::Cancelled)
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.dispatcher.forget(self.generation, self.id);
    }
}
