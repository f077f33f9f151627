//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Bridge error enumeration covering all failure modes.
///
/// Variants carry pre-rendered messages so the same error can be cloned and
/// delivered to every caller waiting on a failed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The tool process could not be launched.
    Spawn(String),
    /// Broken pipe, stream error, or failed handshake on a live connection.
    Transport(String),
    /// The connection terminated while the request was still pending.
    ConnectionClosed(String),
    /// No correlated response arrived within the request window.
    Timeout(String),
    /// The pre-handshake queue is at capacity.
    QueueFull(String),
    /// The submitted message is not a forwardable JSON object.
    InvalidRequest(String),
    /// Request/response correlation violation (e.g. duplicate in-flight id).
    Protocol(String),
    /// Listener or other I/O failure outside the tool streams.
    Io(String),
}

impl AppError {
    /// Whether this error is a request timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::QueueFull(msg) => write!(f, "queue full: {msg}"),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
