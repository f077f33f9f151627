//! One live tool process turned into a request/response channel.
//!
//! # Lifecycle
//!
//! 1. [`ProcessConnection::start`] launches the process, spawns the stdio
//!    tasks and a dispatcher, and writes a priming `ping`.
//! 2. Until the tool sends `initialize`, [`ProcessConnection::send`] parks
//!    messages in a bounded FIFO queue.
//! 3. On `initialize` the dispatcher replies, flips the connection ready and
//!    drains the queue, all under the gate lock, so every queued message is
//!    written before any message sent after readiness.
//! 4. Ready sends register with the [`Correlator`] and hand the message to
//!    the stdin writer outside the gate. Waiting for writer capacity is
//!    bounded by the request deadline, so a tool that stops reading stdin
//!    times requests out instead of stalling the bridge.
//! 5. The first terminal [`StreamEvent`] (exit, EOF, pipe failure), a missed
//!    handshake deadline, or [`ProcessConnection::close`] fails everything
//!    queued or pending and fires the connection's [`CancellationToken`],
//!    stopping the stdio tasks and killing the process. After an exit the
//!    dispatcher first drains whatever stdout still holds, for at most
//!    [`EXIT_DRAIN_GRACE`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::correlator::{Completion, Correlator, PendingResponse, RequestId};
use crate::bridge::handshake;
use crate::bridge::launcher::{ProcessHandle, ProcessLauncher};
use crate::bridge::stdio::{self, StreamEvent};
use crate::config::ConnectionSettings;
use crate::{AppError, Result};

/// Capacity of the channel feeding the stdin writer.
const WRITE_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the channel feeding the dispatcher.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long an exited tool's remaining stdout is still read.
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How the dispatcher treats a value decoded from stdout.
#[derive(Debug, PartialEq)]
enum Inbound {
    /// The tool's `initialize` request; carries the tool's id.
    Handshake(Value),
    /// A value with an id, possibly answering a pending request.
    Response(RequestId),
    /// Anything else: notifications, malformed ids, non-objects.
    Unsolicited,
}

fn classify(value: &Value) -> Inbound {
    if let Some(tool_id) = handshake::initialize_request_id(value) {
        return Inbound::Handshake(tool_id.clone());
    }

    match value.get("id").and_then(RequestId::from_value) {
        Some(id) => Inbound::Response(id),
        None => Inbound::Unsolicited,
    }
}

/// Validate an outbound message and make sure it carries an id.
fn prepare(message: Value) -> Result<(RequestId, Value)> {
    let Value::Object(mut object) = message else {
        return Err(AppError::InvalidRequest(
            "message must be a JSON object".into(),
        ));
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => {
            let (id, value) = RequestId::generate();
            object.insert("id".into(), value);
            id
        }
        Some(value) => RequestId::from_value(value).ok_or_else(|| {
            AppError::InvalidRequest("id must be a string or a number".into())
        })?,
    };

    Ok((id, Value::Object(object)))
}

#[derive(Debug)]
struct QueuedMessage {
    id: RequestId,
    message: Value,
    completion: Completion,
}

/// Readiness state and the pre-handshake queue, guarded together.
#[derive(Debug, Default)]
struct Gate {
    ready: bool,
    closed: bool,
    queued: VecDeque<QueuedMessage>,
}

/// A tool process multiplexing many concurrent requests over its stdio.
pub struct ProcessConnection {
    id: String,
    target: String,
    settings: ConnectionSettings,
    correlator: Correlator,
    gate: Mutex<Gate>,
    ready: AtomicBool,
    writer_tx: mpsc::Sender<Value>,
    closed: CancellationToken,
    started_at: Instant,
}

impl ProcessConnection {
    /// Launch the tool for `target` and start driving it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the launcher cannot start the process.
    pub fn start(
        target: &str,
        launcher: &dyn ProcessLauncher,
        settings: ConnectionSettings,
    ) -> Result<Arc<Self>> {
        let ProcessHandle {
            stdin,
            stdout,
            stderr,
            exit,
        } = launcher.launch(target)?;

        let id = Uuid::new_v4().to_string();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let closed = CancellationToken::new();

        let connection = Arc::new(Self {
            id: id.clone(),
            target: target.to_owned(),
            settings,
            correlator: Correlator::new(settings.request_timeout),
            gate: Mutex::new(Gate::default()),
            ready: AtomicBool::new(false),
            writer_tx,
            closed: closed.clone(),
            started_at: Instant::now(),
        });

        // The channel is still empty, so this cannot hit capacity.
        if connection
            .writer_tx
            .try_send(handshake::priming_ping())
            .is_err()
        {
            warn!(connection_id = %id, container = %target, "failed to queue priming ping");
        }

        tokio::spawn(stdio::run_writer(
            id.clone(),
            stdin,
            writer_rx,
            event_tx.clone(),
            closed.clone(),
        ));
        tokio::spawn(stdio::run_reader(
            id.clone(),
            stdout,
            event_tx.clone(),
            closed.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(stdio::run_stderr(
                id.clone(),
                target.to_owned(),
                stderr,
                closed.clone(),
            ));
        }
        tokio::spawn(stdio::monitor_exit(id.clone(), exit, event_tx, closed));

        connection.spawn_dispatcher(event_rx);
        connection.spawn_handshake_deadline();

        info!(connection_id = %id, container = %target, "connection started, awaiting handshake");
        Ok(connection)
    }

    /// Submit `message` and return a future for its correlated response.
    ///
    /// An object without an `id` (or with a `null` one) gets a UUID v4
    /// string id. Before the handshake completes the message is queued;
    /// after it, the request is registered and written to stdin at once.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidRequest`] if `message` is not an object or its
    ///   id is neither a string nor a number.
    /// - [`AppError::ConnectionClosed`] if the connection has terminated.
    /// - [`AppError::QueueFull`] if the pre-handshake queue is at capacity.
    pub async fn send(&self, message: Value) -> Result<PendingResponse> {
        let (id, message) = prepare(message)?;
        let (completion, response) = PendingResponse::channel(id.clone());

        let mut gate = self.gate.lock().await;

        if gate.closed {
            return Err(AppError::ConnectionClosed(format!(
                "connection to {} is closed",
                self.target
            )));
        }

        if !gate.ready {
            if gate.queued.len() >= self.settings.max_queued {
                warn!(
                    connection_id = %self.id,
                    container = %self.target,
                    limit = self.settings.max_queued,
                    "pre-handshake queue full, rejecting request"
                );
                return Err(AppError::QueueFull(format!(
                    "{} messages already waiting for the {} handshake",
                    gate.queued.len(),
                    self.target
                )));
            }

            gate.queued.push_back(QueuedMessage {
                id,
                message,
                completion,
            });
            debug!(
                connection_id = %self.id,
                queued = gate.queued.len(),
                "request queued until handshake completes"
            );
            return Ok(response);
        }
        drop(gate);

        let deadline = tokio::time::Instant::now() + self.settings.request_timeout;
        self.dispatch(id, message, completion, deadline).await;
        Ok(response)
    }

    /// Terminate the connection, failing everything queued or pending.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.terminate(&AppError::ConnectionClosed(format!(
            "connection to {} closed by the bridge",
            self.target
        )))
        .await;
    }

    /// Unique id of this connection instance.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target the process was launched for.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Whether the connection has terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token fired when the connection terminates.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Number of dispatched requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlator.len()
    }

    /// Number of messages waiting for the handshake.
    pub async fn queued_count(&self) -> usize {
        self.gate.lock().await.queued.len()
    }

    /// Register and write one message. Failures reach the caller through
    /// `completion`.
    ///
    /// Waits for writer capacity until `deadline` at most.
    async fn dispatch(
        &self,
        id: RequestId,
        message: Value,
        completion: Completion,
        deadline: tokio::time::Instant,
    ) {
        if let Err(err) = self.correlator.attach(id.clone(), completion) {
            warn!(connection_id = %self.id, request_id = %id, error = %err, "request rejected");
            return;
        }

        let failure = tokio::select! {
            biased;

            () = self.closed.cancelled() => AppError::ConnectionClosed(format!(
                "connection to {} is closed",
                self.target
            )),

            permit = tokio::time::timeout_at(deadline, self.writer_tx.reserve()) => match permit {
                Ok(Ok(permit)) => {
                    permit.send(message);
                    return;
                }
                Ok(Err(_)) => {
                    AppError::Transport(format!("stdin writer for {} has stopped", self.target))
                }
                Err(_) => AppError::Timeout(format!(
                    "request {id} was never written: {} is not reading stdin",
                    self.target
                )),
            },
        };

        if self.correlator.reject(&id, failure) {
            warn!(connection_id = %self.id, request_id = %id, "request could not be written to stdin");
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut event_rx: mpsc::Receiver<StreamEvent>) {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;

                    () = this.closed.cancelled() => break,
                    event = event_rx.recv() => event,
                };

                let error = match event {
                    Some(StreamEvent::Message(value)) => {
                        this.on_message(value).await;
                        continue;
                    }
                    Some(StreamEvent::Exited(exit)) => {
                        this.drain_after_exit(&mut event_rx).await;
                        AppError::ConnectionClosed(format!("tool {}", exit.reason))
                    }
                    Some(StreamEvent::StdoutClosed) => {
                        AppError::ConnectionClosed("tool closed its stdout".into())
                    }
                    Some(StreamEvent::StdoutFailed(reason)) => {
                        AppError::Transport(format!("stdout read failed: {reason}"))
                    }
                    Some(StreamEvent::StdinFailed(reason)) => {
                        AppError::Transport(format!("stdin {reason}"))
                    }
                    None => AppError::ConnectionClosed("stdio tasks stopped".into()),
                };

                this.terminate(&error).await;
                break;
            }

            debug!(connection_id = %this.id, "dispatcher stopped");
        });
    }

    fn spawn_handshake_deadline(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let deadline = self.settings.handshake_timeout;

        tokio::spawn(async move {
            tokio::select! {
                () = this.closed.cancelled() => {}
                () = tokio::time::sleep(deadline) => {
                    let gate = this.gate.lock().await;
                    if !gate.ready {
                        this.shut_gate(gate, &AppError::Transport(format!(
                            "{} did not complete the initialize handshake within {deadline:?}",
                            this.target
                        )));
                    }
                }
            }
        });
    }

    /// Deliver messages the reader decoded before the process exited.
    ///
    /// Stops at the reader's own terminal event, on cancellation, or once
    /// [`EXIT_DRAIN_GRACE`] has passed.
    async fn drain_after_exit(&self, event_rx: &mut mpsc::Receiver<StreamEvent>) {
        let grace = tokio::time::sleep(EXIT_DRAIN_GRACE);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                biased;

                () = self.closed.cancelled() => return,
                () = &mut grace => {
                    debug!(connection_id = %self.id, "exit drain: grace period elapsed");
                    return;
                }
                event = event_rx.recv() => match event {
                    Some(StreamEvent::Message(value)) => self.on_message(value).await,
                    _ => return,
                },
            }
        }
    }

    async fn on_message(&self, value: Value) {
        match classify(&value) {
            Inbound::Handshake(tool_id) => self.complete_handshake(tool_id).await,
            Inbound::Response(id) => {
                if !self.correlator.resolve(&id, value) {
                    debug!(
                        connection_id = %self.id,
                        request_id = %id,
                        "dropping message with no pending request"
                    );
                }
            }
            Inbound::Unsolicited => {
                debug!(
                    connection_id = %self.id,
                    message = %value,
                    "dropping unsolicited message"
                );
            }
        }
    }

    async fn complete_handshake(&self, tool_id: Value) {
        let reply = self.writer_tx.send(handshake::initialize_reply(tool_id));
        match tokio::time::timeout(self.settings.request_timeout, reply).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!(connection_id = %self.id, "handshake: stdin writer stopped before reply");
                return;
            }
            Err(_) => {
                warn!(connection_id = %self.id, "handshake: tool is not reading stdin, reply dropped");
                return;
            }
        }

        let mut gate = self.gate.lock().await;

        if gate.closed {
            return;
        }
        if gate.ready {
            info!(connection_id = %self.id, "handshake: tool re-initialized, reply sent");
            return;
        }

        gate.ready = true;
        self.ready.store(true, Ordering::Release);
        let queued = std::mem::take(&mut gate.queued);

        info!(
            connection_id = %self.id,
            container = %self.target,
            queued = queued.len(),
            elapsed_ms = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "handshake complete, connection ready"
        );

        // The gate stays held so post-ready sends cannot overtake the queue.
        let deadline = tokio::time::Instant::now() + self.settings.request_timeout;
        for QueuedMessage {
            id,
            message,
            completion,
        } in queued
        {
            self.dispatch(id, message, completion, deadline).await;
        }
    }

    async fn terminate(&self, error: &AppError) {
        let gate = self.gate.lock().await;
        self.shut_gate(gate, error);
    }

    /// Close the gate held in `gate` and fail everything queued or pending.
    fn shut_gate(&self, mut gate: MutexGuard<'_, Gate>, error: &AppError) {
        if gate.closed {
            return;
        }
        gate.closed = true;
        self.closed.cancel();
        let queued = std::mem::take(&mut gate.queued);
        drop(gate);

        let queued_count = queued.len();
        for message in queued {
            let _ = message.completion.send(Err(error.clone()));
        }
        let pending_count = self.correlator.fail_all(error);

        warn!(
            connection_id = %self.id,
            container = %self.target,
            error = %error,
            pending = pending_count,
            queued = queued_count,
            "connection terminated"
        );
    }
}

impl std::fmt::Debug for ProcessConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
