//! Bridge configuration: CLI-supplied target and port plus environment
//! overrides for runtime tuning.

use std::env;
use std::time::Duration;

use crate::{AppError, Result};

/// Default HTTP port when `--port` is not given.
pub const DEFAULT_PORT: u16 = 11434;

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_runtime() -> String {
    "docker".into()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_queued() -> usize {
    256
}

/// Log output format for the tracing subscriber.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// Human-readable text lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Per-connection tuning shared by every connection the registry creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How long a dispatched request may wait for its response.
    pub request_timeout: Duration,
    /// How long a new connection may wait for the tool's `initialize`.
    pub handshake_timeout: Duration,
    /// Maximum messages held while the handshake is pending.
    pub max_queued: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            handshake_timeout: default_handshake_timeout(),
            max_queued: default_max_queued(),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Container the tool process is exec'd into.
    pub target: String,
    /// Address the HTTP listener binds to.
    pub host: String,
    /// Port the HTTP listener binds to.
    pub port: u16,
    /// Container runtime binary (`docker`, `podman`, ...).
    pub runtime: String,
    /// Command run inside the container; empty means the image default.
    pub exec_command: Vec<String>,
    /// Connection tuning.
    pub connection: ConnectionSettings,
    /// Tracing output format.
    pub log_format: LogFormat,
}

impl BridgeConfig {
    /// Build a configuration with defaults for everything but target and port.
    #[must_use]
    pub fn new(target: impl Into<String>, port: u16) -> Self {
        Self {
            target: target.into(),
            host: default_host(),
            port,
            runtime: default_runtime(),
            exec_command: Vec::new(),
            connection: ConnectionSettings::default(),
            log_format: LogFormat::default(),
        }
    }

    /// Build a configuration and apply `BRIDGE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the target is blank or an override
    /// cannot be parsed.
    pub fn from_env(target: impl Into<String>, port: u16) -> Result<Self> {
        Self::from_lookup(target, port, |key| env::var(key).ok())
    }

    /// Build a configuration reading overrides through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the target is blank or an override
    /// cannot be parsed.
    pub fn from_lookup<F>(target: impl Into<String>, port: u16, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(target, port);
        let read = move |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = read("BRIDGE_HOST") {
            config.host = host;
        }
        if let Some(runtime) = read("BRIDGE_CONTAINER_RUNTIME") {
            config.runtime = runtime;
        }
        if let Some(command) = read("BRIDGE_EXEC_COMMAND") {
            config.exec_command = command.split_whitespace().map(str::to_owned).collect();
        }
        if let Some(raw) = read("BRIDGE_REQUEST_TIMEOUT_SECS") {
            config.connection.request_timeout =
                Duration::from_secs(parse_positive("BRIDGE_REQUEST_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = read("BRIDGE_HANDSHAKE_TIMEOUT_SECS") {
            config.connection.handshake_timeout =
                Duration::from_secs(parse_positive("BRIDGE_HANDSHAKE_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = read("BRIDGE_MAX_QUEUED") {
            let max = parse_positive("BRIDGE_MAX_QUEUED", &raw)?;
            config.connection.max_queued = usize::try_from(max)
                .map_err(|_| AppError::Config(format!("BRIDGE_MAX_QUEUED out of range: {max}")))?;
        }
        if let Some(raw) = read("BRIDGE_LOG_FORMAT") {
            config.log_format = match raw.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(AppError::Config(format!(
                        "BRIDGE_LOG_FORMAT must be text or json, got {other}"
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// `host:port` string the listener binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(AppError::Config("target must not be empty".into()));
        }
        if self.runtime.trim().is_empty() {
            return Err(AppError::Config("container runtime must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    match raw.parse::<u64>() {
        Ok(0) => Err(AppError::Config(format!("{key} must be greater than zero"))),
        Ok(value) => Ok(value),
        Err(err) => Err(AppError::Config(format!("{key} is not a number: {err}"))),
    }
}
