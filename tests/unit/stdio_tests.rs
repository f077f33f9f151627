//! Unit tests for the per-process stdio tasks.

use std::future::ready;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stdio_bridge::bridge::launcher::{ExitFuture, ProcessExit};
use stdio_bridge::bridge::stdio::{monitor_exit, run_reader, run_writer, StreamEvent};

async fn next_event(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within deadline")
        .expect("channel open")
}

// ── Reader ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reader_forwards_values_then_reports_eof() {
    let (mut tool_stdout, bridge_stdout) = tokio::io::duplex(256);
    let (tx, mut rx) = mpsc::channel(8);
    tokio::spawn(run_reader(
        "conn-1".into(),
        bridge_stdout,
        tx,
        CancellationToken::new(),
    ));

    tool_stdout
        .write_all(br#"{"id":1,"result":"a"}garbage{"id":2,"#)
        .await
        .expect("write");
    tool_stdout.write_all(br#""result":"b"}"#).await.expect("write");
    drop(tool_stdout);

    assert_eq!(
        next_event(&mut rx).await,
        StreamEvent::Message(json!({"id": 1, "result": "a"}))
    );
    assert_eq!(
        next_event(&mut rx).await,
        StreamEvent::Message(json!({"id": 2, "result": "b"}))
    );
    assert_eq!(next_event(&mut rx).await, StreamEvent::StdoutClosed);
}

#[tokio::test]
async fn reader_stops_silently_on_cancel() {
    let (_tool_stdout, bridge_stdout) = tokio::io::duplex(64);
    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_reader("conn-1".into(), bridge_stdout, tx, cancel.clone()));

    cancel.cancel();
    task.await.expect("reader task");

    assert!(rx.recv().await.is_none(), "no event after cancellation");
}

// ── Writer ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn writer_emits_newline_terminated_json() {
    let (bridge_stdin, mut tool_stdin) = tokio::io::duplex(256);
    let (msg_tx, msg_rx) = mpsc::channel(8);
    let (event_tx, _event_rx) = mpsc::channel(8);
    tokio::spawn(run_writer(
        "conn-1".into(),
        bridge_stdin,
        msg_rx,
        event_tx,
        CancellationToken::new(),
    ));

    msg_tx.send(json!({"id": 1, "method": "ping"})).await.expect("send");
    msg_tx.send(json!({"id": 2, "method": "ping"})).await.expect("send");
    drop(msg_tx);

    let mut written = String::new();
    tool_stdin.read_to_string(&mut written).await.expect("read");
    let lines: Vec<Value> = written
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines, vec![json!({"id": 1, "method": "ping"}), json!({"id": 2, "method": "ping"})]);
}

#[tokio::test]
async fn writer_reports_broken_stdin() {
    let (bridge_stdin, tool_stdin) = tokio::io::duplex(64);
    drop(tool_stdin);
    let (msg_tx, msg_rx) = mpsc::channel(8);
    let (event_tx, mut event_rx) = mpsc::channel(8);
    tokio::spawn(run_writer(
        "conn-1".into(),
        bridge_stdin,
        msg_rx,
        event_tx,
        CancellationToken::new(),
    ));

    msg_tx.send(json!({"id": 1})).await.expect("send");

    assert!(matches!(
        next_event(&mut event_rx).await,
        StreamEvent::StdinFailed(_)
    ));
}

// ── Exit monitor ────────────────────────────────────────────────────────────

#[tokio::test]
async fn exit_is_reported_as_terminal_event() {
    let (tx, mut rx) = mpsc::channel(1);
    let exit: ExitFuture = Box::pin(ready(ProcessExit::with_code(1)));

    monitor_exit("conn-1".into(), exit, tx, CancellationToken::new()).await;

    let event = next_event(&mut rx).await;
    assert!(event.is_terminal());
    assert_eq!(event, StreamEvent::Exited(ProcessExit::with_code(1)));
}

#[tokio::test]
async fn cancelled_monitor_reports_nothing() {
    let (tx, mut rx) = mpsc::channel(1);
    let exit: ExitFuture = Box::pin(std::future::pending());
    let cancel = CancellationToken::new();
    cancel.cancel();

    monitor_exit("conn-1".into(), exit, tx, cancel).await;

    assert!(rx.recv().await.is_none());
}
