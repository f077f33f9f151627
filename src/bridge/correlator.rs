//! Request/response correlation with bounded waits.
//!
//! Every request dispatched to a tool is registered under its id together
//! with a oneshot completion and a timer task. Whichever comes first, the
//! matching response, the timer, or a connection-wide failure, removes the
//! entry from the table and fulfils the completion. Removal and fulfilment
//! happen under one lock acquisition, so an entry is resolved exactly once.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AppError, Result};

/// Sending half of a pending request.
pub type Completion = oneshot::Sender<Result<Value>>;

/// Identifier of an in-flight request.
///
/// Stored as the canonical JSON text of the id, so the string `"1"` and the
/// number `1` are different requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Build an id from a JSON value; only strings and numbers qualify.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) | Value::Number(_) => Some(Self(value.to_string())),
            _ => None,
        }
    }

    /// Generate a fresh UUID v4 string id and its JSON value.
    #[must_use]
    pub fn generate() -> (Self, Value) {
        let value = Value::String(Uuid::new_v4().to_string());
        (Self(value.to_string()), value)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receiving half of a pending request.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingResponse {
    /// Create a linked completion/response pair for `id`.
    #[must_use]
    pub fn channel(id: RequestId) -> (Completion, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    /// Id of the request this response belongs to.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the correlated response.
    ///
    /// # Errors
    ///
    /// - [`AppError::Timeout`] if no response arrived within the window.
    /// - [`AppError::ConnectionClosed`] or [`AppError::Transport`] if the
    ///   connection failed first.
    pub async fn wait(self) -> Result<Value> {
        let id = self.id;
        self.rx.await.unwrap_or_else(|_| {
            Err(AppError::ConnectionClosed(format!(
                "request {id} abandoned before completion"
            )))
        })
    }
}

struct PendingRequest {
    created_at: Instant,
    completion: Completion,
    timer: AbortHandle,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

/// Pending-request table for one connection.
///
/// Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct Correlator {
    pending: PendingTable,
    timeout: Duration,
}

impl Correlator {
    /// Create an empty correlator whose requests expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Register `id` and arm its timeout.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if `id` is already in flight.
    pub fn register(&self, id: RequestId) -> Result<PendingResponse> {
        let (completion, response) = PendingResponse::channel(id.clone());
        self.attach(id, completion)?;
        Ok(response)
    }

    /// Register `id` with an existing completion and arm its timeout.
    ///
    /// On a duplicate id the error is delivered to `completion` as well as
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if `id` is already in flight.
    pub fn attach(&self, id: RequestId, completion: Completion) -> Result<()> {
        let mut pending = lock(&self.pending);

        if pending.contains_key(&id) {
            drop(pending);
            let err = AppError::Protocol(format!("request id {id} is already in flight"));
            let _ = completion.send(Err(err.clone()));
            return Err(err);
        }

        // Spawned under the lock: the timer cannot observe the table
        // before the entry exists.
        let timer = self.spawn_timer(id.clone());
        pending.insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                completion,
                timer,
            },
        );
        Ok(())
    }

    /// Resolve `id` with `value`.
    ///
    /// Returns `false` when no entry exists (late or duplicate response);
    /// the value is discarded.
    #[must_use]
    pub fn resolve(&self, id: &RequestId, value: Value) -> bool {
        let Some(entry) = lock(&self.pending).remove(id) else {
            return false;
        };

        entry.timer.abort();
        debug!(
            request_id = %id,
            elapsed_ms = elapsed_ms(entry.created_at),
            "correlator: response matched"
        );
        let _ = entry.completion.send(Ok(value));
        true
    }

    /// Fail `id` with `error`. Returns `false` if it was not pending.
    #[must_use]
    pub fn reject(&self, id: &RequestId, error: AppError) -> bool {
        let Some(entry) = lock(&self.pending).remove(id) else {
            return false;
        };

        entry.timer.abort();
        let _ = entry.completion.send(Err(error));
        true
    }

    /// Fail every pending entry with `error` and empty the table.
    ///
    /// Returns the number of entries failed.
    #[must_use]
    pub fn fail_all(&self, error: &AppError) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        let count = drained.len();

        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.completion.send(Err(error.clone()));
        }

        if count > 0 {
            warn!(count, error = %error, "correlator: failed all pending requests");
        }
        count
    }

    /// Whether `id` is pending.
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        lock(&self.pending).contains_key(id)
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    fn spawn_timer(&self, id: RequestId) -> AbortHandle {
        let table = Arc::clone(&self.pending);
        let window = self.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let Some(entry) = lock(&table).remove(&id) else {
                return;
            };

            warn!(
                request_id = %id,
                elapsed_ms = elapsed_ms(entry.created_at),
                "correlator: request timed out"
            );
            let _ = entry.completion.send(Err(AppError::Timeout(format!(
                "no response for request {id} within {window:?}"
            ))));
        })
        .abort_handle()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
