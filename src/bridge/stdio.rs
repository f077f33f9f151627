//! Stdio tasks for one tool process.
//!
//! Every connection runs four background tasks over its process handle:
//!
//! | Task             | Direction | Emits                                        |
//! |------------------|-----------|----------------------------------------------|
//! | [`run_reader`]   | stdout    | [`StreamEvent::Message`], `StdoutClosed`, `StdoutFailed` |
//! | [`run_writer`]   | stdin     | [`StreamEvent::StdinFailed`]                 |
//! | [`run_stderr`]   | stderr    | log lines only                               |
//! | [`monitor_exit`] | exit      | [`StreamEvent::Exited`]                      |
//!
//! All of them stop when the connection's [`CancellationToken`] fires.

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::framer::JsonObjectCodec;
use crate::bridge::launcher::{ExitFuture, ProcessExit};

/// Event delivered from the stdio tasks to a connection's dispatcher.
///
/// Every variant other than [`StreamEvent::Message`] is terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A complete JSON value decoded from stdout.
    Message(Value),
    /// Stdout reached EOF.
    StdoutClosed,
    /// Reading stdout failed.
    StdoutFailed(String),
    /// Writing to stdin failed.
    StdinFailed(String),
    /// The process exited.
    Exited(ProcessExit),
}

impl StreamEvent {
    /// Whether this event ends the connection.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Message(_))
    }
}

/// Reader task: frames stdout into JSON values and forwards them.
///
/// Malformed fragments are dropped inside the codec and never stop the
/// reader. On EOF sends [`StreamEvent::StdoutClosed`]; on an I/O error
/// sends [`StreamEvent::StdoutFailed`]. Exits silently on cancellation.
pub async fn run_reader<R>(
    connection_id: String,
    stdout: R,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, JsonObjectCodec::new());

    loop {
        let event = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(connection_id, "stdio reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => match item {
                Some(Ok(value)) => StreamEvent::Message(value),
                Some(Err(e)) => {
                    warn!(connection_id, error = %e, "stdio reader: stdout read failed");
                    StreamEvent::StdoutFailed(e.to_string())
                }
                None => {
                    debug!(connection_id, "stdio reader: EOF detected");
                    StreamEvent::StdoutClosed
                }
            },
        };

        let terminal = event.is_terminal();
        if event_tx.send(event).await.is_err() {
            debug!(connection_id, "stdio reader: event channel closed, stopping");
            return;
        }
        if terminal {
            return;
        }
    }
}

/// Writer task: encodes queued values as newline-terminated JSON on stdin.
///
/// The only writer of the tool's stdin. A failed write sends
/// [`StreamEvent::StdinFailed`] and stops the task; so does a closed
/// message channel, since nothing more can ever be written.
pub async fn run_writer<W>(
    connection_id: String,
    mut stdin: W,
    mut msg_rx: mpsc::Receiver<Value>,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut codec = JsonObjectCodec::new();
    let mut buf = BytesMut::new();

    loop {
        let value = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(connection_id, "stdio writer: cancellation received, stopping");
                return;
            }

            msg = msg_rx.recv() => match msg {
                Some(value) => value,
                None => {
                    debug!(connection_id, "stdio writer: message channel closed, stopping");
                    return;
                }
            },
        };

        buf.clear();
        if let Err(e) = codec.encode(value, &mut buf) {
            warn!(connection_id, error = %e, "stdio writer: dropping unencodable message");
            continue;
        }

        let written = match stdin.write_all(&buf).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!(connection_id, error = %e, "stdio writer: write to stdin failed");
            let _ = event_tx
                .send(StreamEvent::StdinFailed(format!("write failed: {e}")))
                .await;
            return;
        }
    }
}

/// Stderr task: logs each line the tool writes to stderr.
///
/// Stderr output is diagnostic only and never fails the connection.
pub async fn run_stderr<R>(
    connection_id: String,
    target: String,
    stderr: R,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => return,

            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    warn!(connection_id, container = %target, stderr = %line, "tool stderr");
                }
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    debug!(connection_id, error = %e, "stdio stderr: read failed, stopping");
                    return;
                }
            },
        }
    }
}

/// Exit monitor: waits for the process to exit and reports it.
///
/// On cancellation the exit future is dropped, which terminates the
/// process.
pub async fn monitor_exit(
    connection_id: String,
    exit: ExitFuture,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    tokio::select! {
        status = exit => {
            debug!(connection_id, code = ?status.code, reason = %status.reason, "tool process exited");
            if event_tx.send(StreamEvent::Exited(status)).await.is_err() {
                debug!(connection_id, "exit monitor: event channel closed before exit was delivered");
            }
        }
        () = cancel.cancelled() => {
            debug!(connection_id, "exit monitor: cancellation received, stopping tool process");
        }
    }
}
