//! Tool process launching.
//!
//! The bridge never talks to a container runtime API; it runs
//! `<runtime> exec -i <container> [command...]` and owns the resulting
//! child's stdio. [`ProcessLauncher`] is the seam between that and the
//! connection machinery so tests can substitute in-memory pipes for a real
//! process.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::{AppError, Result};

/// Boxed writer for the tool's stdin.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Boxed reader for the tool's stdout or stderr.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Future resolving when the tool process exits.
///
/// Dropping it before completion must terminate the process.
pub type ExitFuture = Pin<Box<dyn Future<Output = ProcessExit> + Send>>;

/// How a tool process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Human-readable description of the exit.
    pub reason: String,
}

impl ProcessExit {
    /// Build an exit record from an exit code.
    #[must_use]
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            reason: format!("process exited with code {code}"),
        }
    }
}

/// Stdio and exit notification of one launched tool process.
pub struct ProcessHandle {
    /// Tool stdin.
    pub stdin: BoxedWriter,
    /// Tool stdout.
    pub stdout: BoxedReader,
    /// Tool stderr, when captured.
    pub stderr: Option<BoxedReader>,
    /// Resolves on exit; owns the process.
    pub exit: ExitFuture,
}

/// Starts tool processes for a target.
pub trait ProcessLauncher: Send + Sync {
    /// Launch the tool process bound to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the process cannot be started.
    fn launch(&self, target: &str) -> Result<ProcessHandle>;
}

/// Launches tools with `<runtime> exec -i <target> [command...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLauncher {
    runtime: String,
    exec_command: Vec<String>,
}

impl ContainerLauncher {
    /// Create a launcher for `runtime` running `exec_command` in the container.
    #[must_use]
    pub fn new(runtime: impl Into<String>, exec_command: Vec<String>) -> Self {
        Self {
            runtime: runtime.into(),
            exec_command,
        }
    }

    /// Create a launcher from the bridge configuration.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.runtime.clone(), config.exec_command.clone())
    }

    /// Program and arguments used to reach `target`.
    #[must_use]
    pub fn command_line(&self, target: &str) -> (String, Vec<String>) {
        let mut args = vec!["exec".to_owned(), "-i".to_owned(), target.to_owned()];
        args.extend(self.exec_command.iter().cloned());
        (self.runtime.clone(), args)
    }
}

impl ProcessLauncher for ContainerLauncher {
    fn launch(&self, target: &str) -> Result<ProcessHandle> {
        let (program, args) = self.command_line(target);

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to spawn {program}: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture tool stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture tool stdout".into()))?;
        let stderr = child.stderr.take();

        info!(container = %target, pid = child.id(), %program, "tool process spawned");

        let exit: ExitFuture = Box::pin(async move {
            match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => ProcessExit::with_code(code),
                    None => ProcessExit {
                        code: None,
                        reason: "process terminated by signal".into(),
                    },
                },
                Err(err) => {
                    warn!(%err, "error waiting for tool process");
                    ProcessExit {
                        code: None,
                        reason: format!("wait error: {err}"),
                    }
                }
            }
        });

        Ok(ProcessHandle {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: stderr.map(|s| Box::pin(s) as BoxedReader),
            exit,
        })
    }
}
