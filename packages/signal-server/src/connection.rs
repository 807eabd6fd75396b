//! Live connection pool: per-connection backpressure and an O(1) dispatch
//! table from connection id to outbound sender.
//!
//! This is deliberately a different concern from `session::SessionRegistry`'s
//! internal connection bookkeeping (its own `bind`/`unbind`, which tracks
//! *which session/client* a connection belongs to). `ConnectionHub` only
//! answers "how do I send bytes to connection N right now" and "how many
//! transport connections are open" -- it has no notion of sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Unique identifier for a live transport connection, assigned by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// A message queued for delivery to a connection's write task.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A complete JSON text frame.
    Text(String),
    /// A close frame with a close code and human-readable reason.
    Close(u16, String),
}

/// Error returned when enqueueing a message to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Channel remained full for the entire timeout.
    Timeout,
    /// The receiver has been dropped; the connection is gone.
    Disconnected,
}

/// Handle to a single live connection, held by the registry and cloned into
/// any task that needs to send to it (e.g. a peer relaying a message).
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    tx: mpsc::Sender<OutboundMessage>,
    pub connected_at: Instant,
    /// Remote socket address, used for rate limiting and diagnostics.
    pub remote_addr: std::net::SocketAddr,
}

impl ConnectionHandle {
    /// Attempts to enqueue a message without blocking.
    ///
    /// Returns `true` if enqueued, `false` if the outbound channel is full
    /// or the connection has already closed.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Enqueues a message, waiting up to `timeout` if the channel is full.
    ///
    /// Used by the relay path so a slow peer applies backpressure to its
    /// sender rather than silently dropping frames.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` if the channel stayed full for the
    /// whole timeout, or `SendError::Disconnected` if the peer is gone.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe pool of all live transport connections.
///
/// Backed by `DashMap` for lock-free concurrent access -- registration and
/// removal happen on every connect/disconnect and must not contend with
/// relay dispatch from unrelated connections.
#[derive(Debug)]
pub struct ConnectionHub {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, returning a handle and the receiver end
    /// the WebSocket write loop should drain.
    pub fn register(
        &self,
        remote_addr: std::net::SocketAddr,
        outbound_channel_capacity: usize,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            connected_at: Instant::now(),
            remote_addr,
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns every live connection. Used during graceful
    /// shutdown to drain the pool.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        keys.into_iter().filter_map(|k| self.remove(k)).collect()
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}
