//! Unit tests for bridge configuration and environment overrides.

use std::collections::HashMap;
use std::time::Duration;

use stdio_bridge::config::{BridgeConfig, ConnectionSettings, LogFormat, DEFAULT_PORT};
use stdio_bridge::AppError;

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

// ── Defaults ────────────────────────────────────────────────────────────────

#[test]
fn defaults_apply_without_overrides() {
    let config = BridgeConfig::from_lookup("tools", DEFAULT_PORT, lookup(&[])).expect("valid");

    assert_eq!(config.target, "tools");
    assert_eq!(config.port, 11434);
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.runtime, "docker");
    assert!(config.exec_command.is_empty());
    assert_eq!(config.log_format, LogFormat::Text);
    assert_eq!(config.connection, ConnectionSettings::default());
}

#[test]
fn default_connection_settings() {
    let settings = ConnectionSettings::default();

    assert_eq!(settings.request_timeout, Duration::from_secs(30));
    assert_eq!(settings.handshake_timeout, Duration::from_secs(30));
    assert_eq!(settings.max_queued, 256);
}

// ── Overrides ───────────────────────────────────────────────────────────────

#[test]
fn environment_overrides_are_applied() {
    let config = BridgeConfig::from_lookup(
        "tools",
        8080,
        lookup(&[
            ("BRIDGE_HOST", "0.0.0.0"),
            ("BRIDGE_CONTAINER_RUNTIME", "podman"),
            ("BRIDGE_EXEC_COMMAND", "  node  /app/server.js "),
            ("BRIDGE_REQUEST_TIMEOUT_SECS", "5"),
            ("BRIDGE_HANDSHAKE_TIMEOUT_SECS", "12"),
            ("BRIDGE_MAX_QUEUED", "8"),
            ("BRIDGE_LOG_FORMAT", "JSON"),
        ]),
    )
    .expect("valid");

    assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    assert_eq!(config.runtime, "podman");
    assert_eq!(config.exec_command, vec!["node", "/app/server.js"]);
    assert_eq!(config.connection.request_timeout, Duration::from_secs(5));
    assert_eq!(config.connection.handshake_timeout, Duration::from_secs(12));
    assert_eq!(config.connection.max_queued, 8);
    assert_eq!(config.log_format, LogFormat::Json);
}

#[test]
fn blank_overrides_are_ignored() {
    let config = BridgeConfig::from_lookup(
        "tools",
        DEFAULT_PORT,
        lookup(&[("BRIDGE_CONTAINER_RUNTIME", "   "), ("BRIDGE_MAX_QUEUED", "")]),
    )
    .expect("valid");

    assert_eq!(config.runtime, "docker");
    assert_eq!(config.connection.max_queued, 256);
}

// ── Validation ──────────────────────────────────────────────────────────────

#[test]
fn zero_timeout_is_rejected() {
    let err = BridgeConfig::from_lookup(
        "tools",
        DEFAULT_PORT,
        lookup(&[("BRIDGE_REQUEST_TIMEOUT_SECS", "0")]),
    )
    .expect_err("zero must be rejected");

    assert!(matches!(err, AppError::Config(_)));
    assert!(err.to_string().contains("BRIDGE_REQUEST_TIMEOUT_SECS"));
}

#[test]
fn non_numeric_queue_cap_is_rejected() {
    let err = BridgeConfig::from_lookup(
        "tools",
        DEFAULT_PORT,
        lookup(&[("BRIDGE_MAX_QUEUED", "many")]),
    )
    .expect_err("must be rejected");

    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn unknown_log_format_is_rejected() {
    let err = BridgeConfig::from_lookup(
        "tools",
        DEFAULT_PORT,
        lookup(&[("BRIDGE_LOG_FORMAT", "xml")]),
    )
    .expect_err("must be rejected");

    assert!(err.to_string().contains("xml"));
}

#[test]
fn blank_target_is_rejected() {
    let err = BridgeConfig::from_lookup("  ", DEFAULT_PORT, lookup(&[])).expect_err("blank");
    assert!(matches!(err, AppError::Config(_)));
}
