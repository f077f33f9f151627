//! HTTP front end of the bridge.
//!
//! A single fallback handler dispatches on method and path:
//!
//! | Request                  | Response                                  |
//! |--------------------------|-------------------------------------------|
//! | `POST <any path>`        | relayed to the tool; 200 or 500 `{error}` |
//! | `OPTIONS <any path>`     | 204                                       |
//! | `GET /ping`, `/health`   | 200 `{"status":"ok"}`                     |
//! | `GET /status`            | 200 connection snapshot                   |
//! | anything else            | 405                                       |
//!
//! Every response carries permissive CORS headers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::framer::MAX_OBJECT_BYTES;
use crate::bridge::registry::{ConnectionRegistry, ConnectionSnapshot};
use crate::config::BridgeConfig;
use crate::{AppError, Result};

/// Methods the bridge answers; sent in `Allow` on 405 responses.
const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";

/// Shared state handed to every request.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Bridge configuration.
    pub config: Arc<BridgeConfig>,
    /// Live connections keyed by target.
    pub registry: ConnectionRegistry,
    /// Wall-clock start time reported by `/status`.
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl AppState {
    /// Create state for a bridge starting now.
    #[must_use]
    pub fn new(config: Arc<BridgeConfig>, registry: ConnectionRegistry) -> Self {
        Self {
            config,
            registry,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    target: &'a str,
    #[serde(flatten)]
    connection: ConnectionSnapshot,
    started_at: DateTime<Utc>,
    uptime_sec: u64,
}

/// Build the bridge router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(middleware::from_fn(apply_cors))
        .with_state(state)
}

/// Bind the listener described by `config`.
///
/// # Errors
///
/// Returns `AppError::Io` if the address cannot be bound.
pub async fn bind(config: &BridgeConfig) -> Result<TcpListener> {
    let addr = config.bind_addr();
    TcpListener::bind(&addr)
        .await
        .map_err(|err| AppError::Io(format!("failed to bind {addr}: {err}")))
}

/// Serve the bridge on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve(listener: TcpListener, state: AppState, ct: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Io(format!("failed to read listener address: {err}")))?;
    info!(%addr, container = %state.config.target, "http server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(ct.cancelled_owned())
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("http server shut down");
    Ok(())
}

async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }

    if method == Method::POST {
        return match relay(&state, request).await {
            Ok(value) => Json(value).into_response(),
            Err(err) => error_response(&err),
        };
    }

    if method == Method::GET {
        match path.as_str() {
            "/ping" | "/health" => return Json(json!({"status": "ok"})).into_response(),
            "/status" => return status(&state).await.into_response(),
            _ => {}
        }
    }

    debug!(%method, path, "rejecting unsupported request");
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, ALLOWED_METHODS)],
        Json(json!({"error": format!("{method} {path} is not supported")})),
    )
        .into_response()
}

/// Forward one POST body to the tool and wait for its correlated reply.
async fn relay(state: &AppState, request: Request) -> Result<Value> {
    let body = axum::body::to_bytes(request.into_body(), MAX_OBJECT_BYTES)
        .await
        .map_err(|err| AppError::InvalidRequest(format!("failed to read request body: {err}")))?;
    let message: Value = serde_json::from_slice(&body)?;

    let connection = state.registry.get_or_create(&state.config.target).await?;
    let pending = connection.send(message).await?;
    debug!(
        connection_id = connection.id(),
        request_id = %pending.id(),
        "relay: request submitted"
    );

    pending.wait().await
}

async fn status(state: &AppState) -> Json<StatusBody<'_>> {
    Json(StatusBody {
        target: &state.config.target,
        connection: state.registry.snapshot(&state.config.target).await,
        started_at: state.started_at,
        uptime_sec: state.started.elapsed().as_secs(),
    })
}

fn error_response(err: &AppError) -> Response {
    warn!(error = %err, "relay: request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

async fn apply_cors(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}
