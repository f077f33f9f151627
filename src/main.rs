#![forbid(unsafe_code)]

//! `stdio-bridge`: HTTP bridge binary.
//!
//! Parses the target and port, applies environment overrides, then serves
//! HTTP until SIGINT/SIGTERM, relaying POST bodies to a tool process
//! launched lazily inside the target container.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use stdio_bridge::bridge::{ConnectionRegistry, ContainerLauncher};
use stdio_bridge::cli::Cli;
use stdio_bridge::config::LogFormat;
use stdio_bridge::server::{self, AppState};
use stdio_bridge::{AppError, BridgeConfig, Result};

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = BridgeConfig::from_env(args.target, args.port)?;
    init_tracing(config.log_format)?;
    info!(container = %config.target, port = config.port, "stdio-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(config))
}

async fn run(config: BridgeConfig) -> Result<()> {
    let config = Arc::new(config);
    let launcher = Arc::new(ContainerLauncher::from_config(&config));
    let registry = ConnectionRegistry::new(launcher, config.connection);
    let state = AppState::new(Arc::clone(&config), registry.clone());

    let listener = server::bind(&config).await?;

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    let signal_registry = registry.clone();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!(signal, "shutdown signal received");
        signal_ct.cancel();
        // In-flight relays fail now instead of holding the drain open.
        signal_registry.shutdown().await;
    });

    let result = server::serve(listener, state, ct).await;
    if let Err(ref err) = result {
        error!(%err, "http server stopped with an error");
    }

    // ── Tear down tool processes ────────────────────────
    registry.shutdown().await;

    info!("stdio-bridge shut down");
    result
}

/// Resolve with the name of the first shutdown signal received.
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        warn!("SIGTERM handler unavailable, shutting down on SIGINT only");
        return interrupt().await;
    };

    tokio::select! {
        name = interrupt() => name,
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    interrupt().await
}

async fn interrupt() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "SIGINT handler failed");
    }
    "SIGINT"
}

/// Install the global subscriber. Logs go to stderr; stdout stays clean.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let output = fmt::layer().with_writer(std::io::stderr);
    let output = match log_format {
        LogFormat::Text => output.boxed(),
        LogFormat::Json => output.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|err| AppError::Config(format!("tracing subscriber already set: {err}")))
}
