//! Target-keyed cache of live connections.
//!
//! At most one live [`ProcessConnection`] exists per target. Lookup and
//! creation happen under one lock, so concurrent callers for a missing
//! target share a single launch. A watcher per connection evicts the entry
//! when the connection terminates, and the next request launches a fresh
//! process.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bridge::connection::ProcessConnection;
use crate::bridge::launcher::ProcessLauncher;
use crate::config::ConnectionSettings;
use crate::Result;

/// Lifecycle state of a target, as reported by `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live connection.
    None,
    /// Process running, handshake outstanding.
    Connecting,
    /// Handshake complete.
    Ready,
}

/// Point-in-time view of a target's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    /// Connection state.
    pub state: ConnectionState,
    /// Requests awaiting a response.
    pub pending: usize,
    /// Messages waiting for the handshake.
    pub queued: usize,
}

impl ConnectionSnapshot {
    const NONE: Self = Self {
        state: ConnectionState::None,
        pending: 0,
        queued: 0,
    };
}

struct RegistryInner {
    launcher: Arc<dyn ProcessLauncher>,
    settings: ConnectionSettings,
    connections: Mutex<HashMap<String, Arc<ProcessConnection>>>,
}

/// Shared registry of connections; clones share the same table.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create an empty registry launching processes with `launcher`.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, settings: ConnectionSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                launcher,
                settings,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Return the live connection for `target`, launching one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Spawn`] if a new process cannot be launched.
    /// Nothing is cached on failure, so the next call retries.
    pub async fn get_or_create(&self, target: &str) -> Result<Arc<ProcessConnection>> {
        let mut connections = self.inner.connections.lock().await;

        if let Some(existing) = connections.get(target) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            debug!(container = %target, connection_id = existing.id(), "replacing terminated connection");
        }

        let connection =
            ProcessConnection::start(target, self.inner.launcher.as_ref(), self.inner.settings)?;
        connections.insert(target.to_owned(), Arc::clone(&connection));
        drop(connections);

        self.spawn_evictor(&connection);
        Ok(connection)
    }

    /// Return the cached connection for `target`, if any.
    pub async fn get(&self, target: &str) -> Option<Arc<ProcessConnection>> {
        self.inner.connections.lock().await.get(target).cloned()
    }

    /// Close and forget the connection for `target`.
    ///
    /// Returns `false` if none was cached.
    pub async fn remove(&self, target: &str) -> bool {
        let removed = self.inner.connections.lock().await.remove(target);
        match removed {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Snapshot the state of `target`'s connection.
    pub async fn snapshot(&self, target: &str) -> ConnectionSnapshot {
        let Some(connection) = self.get(target).await else {
            return ConnectionSnapshot::NONE;
        };
        if connection.is_closed() {
            return ConnectionSnapshot::NONE;
        }

        let state = if connection.is_ready() {
            ConnectionState::Ready
        } else {
            ConnectionState::Connecting
        };

        ConnectionSnapshot {
            state,
            pending: connection.pending_count(),
            queued: connection.queued_count().await,
        }
    }

    /// Number of cached connections.
    pub async fn len(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Whether no connections are cached.
    pub async fn is_empty(&self) -> bool {
        self.inner.connections.lock().await.is_empty()
    }

    /// Close every connection. Used on bridge shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self
            .inner
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        let count = drained.len();
        for connection in drained {
            connection.close().await;
        }
        info!(count, "registry: all connections closed");
    }

    /// Evict `connection` once it terminates, unless it was already replaced.
    fn spawn_evictor(&self, connection: &Arc<ProcessConnection>) {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let token = connection.close_token();
        let target = connection.target().to_owned();
        let connection_id = connection.id().to_owned();

        tokio::spawn(async move {
            token.cancelled().await;

            let Some(inner) = registry.upgrade() else {
                return;
            };
            let mut connections = inner.connections.lock().await;
            if connections
                .get(&target)
                .is_some_and(|current| current.id() == connection_id)
            {
                connections.remove(&target);
                debug!(container = %target, connection_id, "registry: evicted terminated connection");
            }
        });
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}
