//! A single user connection and its lifecycle state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::wsrouter::transport::Transport;

/// Lifecycle of a connection from acceptance to removal.
///
/// Transitions only ever move forward: `Accepted -> ProcessingReady ->
/// Closing -> Closed`. There is no path back to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport accepted the connection but it has not yet signalled
    /// it's ready to receive routed events.
    Accepted,
    /// The connection can receive sends.
    ProcessingReady,
    /// A close has been requested; in-flight sends may still complete but
    /// no new ones may start.
    Closing,
    /// The connection is gone and must be removed from every index.
    Closed,
}

/// One user's live connection, as tracked by the
/// [`ConnectionManager`](crate::wsrouter::connection_manager::ConnectionManager).
///
/// `connection_id` is assigned once at construction and never recomputed —
/// it is the stable key every index (including the failed-delivery queue)
/// keys off of.
#[derive(Clone)]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    pub sink: Arc<dyn Transport>,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: ConnectionState,
    pub metadata: Map<String, Value>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .field("last_activity_at", &self.last_activity_at)
            .field("state", &self.state)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Connection {
    /// Construct a new connection in the `Accepted` state.
    pub fn new(connection_id: String, user_id: String, sink: Arc<dyn Transport>) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            user_id,
            sink,
            connected_at: now,
            last_activity_at: now,
            state: ConnectionState::Accepted,
            metadata: Map::new(),
        }
    }

    /// Whether this connection may currently accept a send.
    pub fn is_sendable(&self) -> bool {
        matches!(self.state, ConnectionState::ProcessingReady)
    }

    /// Whether a close has already been initiated or completed — the guard
    /// a send must check from inside its own critical section to avoid
    /// racing a concurrent close.
    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }

    /// Mark the connection ready to receive routed events.
    pub fn mark_ready(&mut self) {
        if self.state == ConnectionState::Accepted {
            self.state = ConnectionState::ProcessingReady;
        }
    }

    /// Begin closing. Idempotent: calling this on an already-closing or
    /// closed connection is a no-op.
    pub fn begin_closing(&mut self) {
        if matches!(self.state, ConnectionState::Accepted | ConnectionState::ProcessingReady) {
            self.state = ConnectionState::Closing;
        }
    }

    /// Finalize the close.
    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}
