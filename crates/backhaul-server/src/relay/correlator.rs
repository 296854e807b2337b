//! Request correlator: pairs bus responses with waiting callers.
//!
//! A caller registers a request id before publishing, then waits on the
//! returned slot. The response consumer completes the slot by id. Every
//! slot resolves at most once: either by the first matching response or by
//! the caller's timeout, after which late responses are ignored.

use backhaul_core::{HttpResponseModel, RelayError, RelayResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// A registered, not yet resolved request.
#[derive(Debug)]
pub struct PendingResponse<T> {
    id: String,
    rx: oneshot::Receiver<T>,
}

impl<T> PendingResponse<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Table of pending requests keyed by request id.
pub struct RequestCorrelator<T = HttpResponseModel> {
    pending: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T: Send> RequestCorrelator<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Open a slot for `id`. Must happen before the request is published.
    pub async fn register(&self, id: &str) -> PendingResponse<T> {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().await.insert(id.to_string(), tx).is_some() {
            warn!(request_id = %id, "request id registered twice; previous waiter dropped");
        }
        PendingResponse {
            id: id.to_string(),
            rx,
        }
    }

    /// Resolve the slot for `id`. Returns `false` when no caller is waiting
    /// (unknown id, already resolved, or timed out).
    pub async fn complete(&self, id: &str, response: T) -> bool {
        let Some(tx) = self.pending.lock().await.remove(id) else {
            debug!(request_id = %id, "no pending request for response");
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Wait for the slot to resolve, up to `timeout`.
    ///
    /// On timeout the slot is withdrawn so a late response is discarded.
    pub async fn wait(&self, pending: PendingResponse<T>, timeout: Duration) -> RelayResult<T> {
        let PendingResponse { id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                debug!(request_id = %id, "pending request abandoned");
                Err(RelayError::ResponseTimeout)
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(RelayError::ResponseTimeout)
            }
        }
    }

    /// Withdraw a slot whose request never made it onto the bus.
    pub async fn cancel(&self, pending: PendingResponse<T>) {
        self.pending.lock().await.remove(&pending.id);
    }

    /// Number of requests still waiting.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl<T: Send> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self::new()
    }
}
