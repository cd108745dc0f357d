//! Per-user connection registry, safe send, retry, and recovery.
//!
//! Grounded on `agent_communication.py`'s connection bookkeeping and
//! `error_handler.py`'s centralized error classification, rebuilt around
//! `tokio::sync::RwLock` the way `cloudllm::tools::memory::Memory` guards
//! shared state behind a lock held for the duration of the operation
//! rather than released between check and act.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::wsrouter::config::ConnectionManagerConfig;
use crate::wsrouter::connection::{Connection, ConnectionState};
use crate::wsrouter::event::Envelope;
use crate::wsrouter::serialize::serialize_safely;
use crate::wsrouter::transport::{ClientState, Transport};

/// One envelope that failed delivery and is waiting for its user to
/// reconnect.
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub connection_id: String,
    pub envelope: Envelope,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

enum SendOutcome {
    Sent,
    NotFound,
    NotReady,
    Permanent { user_id: String, reason: String },
    Transient { user_id: String, reason: String },
}

/// Per-user connections, a failed-delivery recovery queue, and the send
/// path that ties retry policy and safe serialization together.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    connections: RwLock<HashMap<String, Connection>>,
    user_connections: RwLock<HashMap<String, HashSet<String>>>,
    failed_deliveries: Mutex<HashMap<String, VecDeque<FailedDelivery>>>,
    error_stats: Mutex<HashMap<String, u64>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            user_connections: RwLock::new(HashMap::new()),
            failed_deliveries: Mutex::new(HashMap::new()),
            error_stats: Mutex::new(HashMap::new()),
        }
    }

    async fn record_error(&self, kind: &str) {
        let mut stats = self.error_stats.lock().await;
        *stats.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Register a new connection in the `Accepted` state. Does not yet
    /// accept sends — call [`mark_connection_ready`](Self::mark_connection_ready)
    /// once the transport signals it's ready.
    pub async fn add_connection(&self, connection_id: &str, user_id: &str, sink: Arc<dyn Transport>) -> bool {
        if connection_id.is_empty() || user_id.is_empty() {
            return false;
        }
        let connection = Connection::new(connection_id.to_string(), user_id.to_string(), sink);
        {
            let mut connections = self.connections.write().await;
            if connections.contains_key(connection_id) {
                return false;
            }
            connections.insert(connection_id.to_string(), connection);
        }
        let mut user_connections = self.user_connections.write().await;
        user_connections
            .entry(user_id.to_string())
            .or_insert_with(HashSet::new)
            .insert(connection_id.to_string());
        log::debug!("connection {connection_id} accepted for user {user_id}");
        true
    }

    /// Transition a connection to `ProcessingReady` and drain any queued
    /// recovery deliveries for its user, in FIFO order, tagged `recovered`.
    pub async fn mark_connection_ready(&self, connection_id: &str) -> bool {
        let user_id = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(connection_id) {
                Some(conn) if conn.state == ConnectionState::Accepted => {
                    conn.mark_ready();
                    conn.user_id.clone()
                }
                Some(_) => return false,
                None => return false,
            }
        };
        self.drain_recovery_queue(&user_id).await;
        true
    }

    /// Begin closing and remove a connection from every index. Idempotent.
    pub async fn remove_connection(&self, connection_id: &str) -> bool {
        let user_id = {
            let mut connections = self.connections.write().await;
            let conn = match connections.get_mut(connection_id) {
                Some(conn) => conn,
                None => return false,
            };
            conn.begin_closing();
            conn.sink.close().await;
            conn.mark_closed();
            let user_id = conn.user_id.clone();
            connections.remove(connection_id);
            user_id
        };
        let mut user_connections = self.user_connections.write().await;
        if let Some(set) = user_connections.get_mut(&user_id) {
            set.remove(connection_id);
            if set.is_empty() {
                user_connections.remove(&user_id);
            }
        }
        true
    }

    pub async fn is_connection_active(&self, connection_id: &str) -> bool {
        let connections = self.connections.read().await;
        connections.get(connection_id).map(|c| c.is_sendable()).unwrap_or(false)
    }

    pub async fn get_user_connections(&self, user_id: &str) -> Vec<String> {
        let user_connections = self.user_connections.read().await;
        user_connections
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn error_stats(&self) -> HashMap<String, u64> {
        self.error_stats.lock().await.clone()
    }

    /// Holding the read lock across the send is what makes the close check
    /// race-free: `remove_connection` cannot acquire its write lock (and
    /// therefore cannot flip the state) until this read guard drops.
    async fn attempt_send(&self, connection_id: &str, payload: &serde_json::Value) -> SendOutcome {
        let connections = self.connections.read().await;
        let conn = match connections.get(connection_id) {
            Some(conn) => conn,
            None => return SendOutcome::NotFound,
        };
        if !conn.is_sendable() {
            return SendOutcome::NotReady;
        }
        if conn.sink.client_state().await == ClientState::Closed {
            return SendOutcome::Permanent {
                user_id: conn.user_id.clone(),
                reason: "permanent: transport already closed".into(),
            };
        }
        match conn.sink.send_json(payload).await {
            Ok(()) => SendOutcome::Sent,
            Err(reason) if reason.starts_with("permanent") => {
                SendOutcome::Permanent { user_id: conn.user_id.clone(), reason }
            }
            Err(reason) => SendOutcome::Transient { user_id: conn.user_id.clone(), reason },
        }
    }

    async fn touch(&self, connection_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.touch();
        }
    }

    /// Flag a connection as closing after its send was classified as a
    /// permanently failed transport. Does not remove it from any index —
    /// that still only happens via `remove_connection`.
    async fn flag_connection_closing(&self, connection_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.begin_closing();
        }
    }

    async fn enqueue_failed(&self, user_id: &str, connection_id: &str, envelope: &Envelope, reason: String) {
        let mut failed = self.failed_deliveries.lock().await;
        let queue = failed.entry(user_id.to_string()).or_insert_with(VecDeque::new);
        if queue.len() >= self.config.max_failed_queue {
            queue.pop_front();
            self.record_error("failed_queue_overflow").await;
        }
        queue.push_back(FailedDelivery {
            connection_id: connection_id.to_string(),
            envelope: envelope.clone(),
            failed_at: Utc::now(),
            reason,
        });
    }

    /// Send `envelope` to `connection_id`, retrying transient failures with
    /// `base * 2^n` backoff up to `max_retries`, then promoting the message
    /// to the sender's failed-delivery queue.
    pub async fn send_message(&self, connection_id: &str, envelope: &Envelope) -> bool {
        let payload = serialize_safely(envelope);
        let mut attempt = 0u32;
        loop {
            match self.attempt_send(connection_id, &payload).await {
                SendOutcome::Sent => {
                    self.touch(connection_id).await;
                    return true;
                }
                SendOutcome::NotFound | SendOutcome::NotReady => {
                    self.record_error("send_no_target").await;
                    return false;
                }
                SendOutcome::Permanent { user_id, reason } => {
                    self.record_error("permanent_transport").await;
                    log::warn!("permanent send failure on {connection_id}: {reason}");
                    self.enqueue_failed(&user_id, connection_id, envelope, reason).await;
                    self.flag_connection_closing(connection_id).await;
                    return false;
                }
                SendOutcome::Transient { user_id, reason } => {
                    if attempt >= self.config.max_retries {
                        self.record_error("transient_transport_exhausted").await;
                        self.enqueue_failed(&user_id, connection_id, envelope, reason).await;
                        return false;
                    }
                    let backoff = self.config.retry_backoff_base * 2u32.pow(attempt);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Send to every ready connection belonging to `user_id`. Returns the
    /// number of connections that accepted the send.
    pub async fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> usize {
        let connection_ids = self.get_user_connections(user_id).await;
        let mut delivered = 0;
        for connection_id in connection_ids {
            if self.send_message(&connection_id, envelope).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send to every ready connection across every user.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let connection_ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        let mut delivered = 0;
        for connection_id in connection_ids {
            if self.send_message(&connection_id, envelope).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a critical event to a user. If the user has no ready
    /// connections at all, the event is queued directly for recovery rather
    /// than silently dropped — critical events must survive a disconnect.
    pub async fn emit_critical_event(&self, user_id: &str, envelope: &Envelope) -> bool {
        let connection_ids = self.get_user_connections(user_id).await;
        if connection_ids.is_empty() {
            self.enqueue_failed(user_id, "no_active_connection", envelope, "no active connection".into())
                .await;
            return false;
        }
        self.send_to_user(user_id, envelope).await > 0
    }

    /// Drain `user_id`'s failed-delivery queue in FIFO order onto its
    /// currently ready connections, tagging each with `recovered: true` and
    /// `original_failure`.
    async fn drain_recovery_queue(&self, user_id: &str) {
        let queued: Vec<FailedDelivery> = {
            let mut failed = self.failed_deliveries.lock().await;
            match failed.remove(user_id) {
                Some(queue) => queue.into_iter().collect(),
                None => return,
            }
        };
        for item in queued {
            let mut envelope = item.envelope;
            envelope.fields.insert("recovered".into(), serde_json::Value::Bool(true));
            envelope
                .fields
                .insert("original_failure".into(), serde_json::Value::String(item.reason.clone()));
            self.send_to_user(user_id, &envelope).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wsrouter::event::{build_envelope, BusinessEvent, RoutingIds};
    use crate::wsrouter::transport::test_support::ChannelTransport;

    fn event() -> Envelope {
        build_envelope(
            BusinessEvent::ProgressUpdate { percentage: 10.0, message: "starting".into() },
            RoutingIds::default(),
        )
    }

    #[tokio::test]
    async fn send_requires_ready_state() {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default());
        let (transport, mut rx) = ChannelTransport::new();
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        assert!(!manager.send_message("c1", &event()).await);
        assert!(manager.mark_connection_ready("c1").await);
        assert!(manager.send_message("c1", &event()).await);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_after_close_fails_without_panicking() {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default());
        let (transport, _rx) = ChannelTransport::new();
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        manager.remove_connection("c1").await;
        assert!(!manager.send_message("c1", &event()).await);
        assert!(!manager.is_connection_active("c1").await);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let manager = ConnectionManager::new(ConnectionManagerConfig {
            retry_backoff_base: std::time::Duration::from_millis(1),
            ..ConnectionManagerConfig::default()
        });
        let (transport, mut rx) = ChannelTransport::new();
        transport.fail_next(2);
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        assert!(manager.send_message("c1", &event()).await);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_queue_for_recovery() {
        let manager = ConnectionManager::new(ConnectionManagerConfig {
            max_retries: 2,
            retry_backoff_base: std::time::Duration::from_millis(1),
            ..ConnectionManagerConfig::default()
        });
        let (transport, _rx) = ChannelTransport::new();
        transport.fail_permanently();
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        assert!(!manager.send_message("c1", &event()).await);
        let stats = manager.error_stats().await;
        assert!(stats.contains_key("permanent_transport"));
    }

    #[tokio::test]
    async fn reconnect_drains_failed_queue_tagged_recovered() {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default());
        let (transport, _rx) = ChannelTransport::new();
        transport.fail_permanently();
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        manager.send_message("c1", &event()).await;
        manager.remove_connection("c1").await;

        let (transport2, mut rx2) = ChannelTransport::new();
        manager.add_connection("c2", "u1", Arc::new(transport2)).await;
        manager.mark_connection_ready("c2").await;

        let recovered = rx2.recv().await.unwrap();
        assert_eq!(recovered["recovered"], serde_json::json!(true));
        assert!(recovered.get("original_failure").is_some());
    }

    #[tokio::test]
    async fn failed_queue_is_bounded_and_drops_oldest() {
        let manager = ConnectionManager::new(ConnectionManagerConfig {
            max_failed_queue: 2,
            ..ConnectionManagerConfig::default()
        });
        let (transport, _rx) = ChannelTransport::new();
        transport.fail_permanently();
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        for i in 0..5 {
            let envelope = build_envelope(
                BusinessEvent::ProgressUpdate { percentage: i as f64, message: format!("m{i}") },
                RoutingIds::default(),
            );
            manager.send_message("c1", &envelope).await;
        }
        manager.remove_connection("c1").await;

        let (transport2, mut rx2) = ChannelTransport::new();
        manager.add_connection("c2", "u1", Arc::new(transport2)).await;
        manager.mark_connection_ready("c2").await;

        let first = rx2.recv().await.unwrap();
        assert_eq!(first["message"], serde_json::json!("m3"));
        let second = rx2.recv().await.unwrap();
        assert_eq!(second["message"], serde_json::json!("m4"));
    }

    #[tokio::test]
    async fn permanent_failure_flags_connection_closing_without_remove() {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default());
        let (transport, _rx) = ChannelTransport::new();
        transport.fail_permanently();
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        assert!(!manager.send_message("c1", &event()).await);
        assert!(!manager.is_connection_active("c1").await);
        // Still present in the index — only `remove_connection` detaches it.
        assert_eq!(manager.get_connection_count().await, 1);
    }

    #[tokio::test]
    async fn closed_transport_short_circuits_send_as_permanent() {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default());
        let (transport, _rx) = ChannelTransport::new();
        transport.close().await;
        manager.add_connection("c1", "u1", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        assert!(!manager.send_message("c1", &event()).await);
        let stats = manager.error_stats().await;
        assert!(stats.contains_key("permanent_transport"));
        assert!(!manager.is_connection_active("c1").await);
    }

    #[tokio::test]
    async fn emit_critical_event_queues_when_no_connections() {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default());
        assert!(!manager.emit_critical_event("ghost_user", &event()).await);
        let (transport, mut rx) = ChannelTransport::new();
        manager.add_connection("c1", "ghost_user", Arc::new(transport)).await;
        manager.mark_connection_ready("c1").await;
        assert!(rx.recv().await.is_some());
    }
}
