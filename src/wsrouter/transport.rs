//! External interface contracts: the transport sink a connection sends
//! through, and the orchestrator a bridge resolves run ids against.
//!
//! Both are `#[async_trait]` traits over `Send + Sync` trait objects,
//! following the collaborator-boundary idiom of
//! `cloudllm::tool_protocol::ToolProtocol`: callers depend on the trait,
//! never on a concrete transport, so tests can swap in a channel-backed
//! double and production can swap in an `axum` WebSocket sink.

use async_trait::async_trait;
use serde_json::Value;

/// Coarse transport health, as reported by [`Transport::client_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Open,
    Closing,
    Closed,
}

/// A single connection's send/close surface.
///
/// Implementations must be total: `send_json` never panics, and returns
/// `Ok(())` only once the payload has actually been handed to the
/// underlying socket (not merely queued for serialization).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a JSON value. Errors are reported as a plain `String` reason —
    /// the [`ConnectionManager`](crate::wsrouter::connection_manager::ConnectionManager)
    /// classifies the string into its retry policy, mirroring how
    /// `error_handler.py` classified raw transport exceptions by message.
    async fn send_json(&self, value: &Value) -> Result<(), String>;

    /// Close the underlying socket. Idempotent.
    async fn close(&self);

    /// Current transport-level state.
    async fn client_state(&self) -> ClientState;
}

/// The agent runtime's side of run-id resolution: the orchestrator callback
/// tier consulted when the registry has no mapping for a run.
///
/// Passed to the bridge as a trait object rather than requiring the bridge
/// to hold a reference back to the orchestrator's own connection manager,
/// which would create a `Bridge` <-> `ConnectionManager` cycle.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Best-effort lookup of the thread a run belongs to, independent of
    /// the registry. Returns `None` if the orchestrator has no opinion.
    async fn get_thread_id_for_run(&self, run_id: &str) -> Option<String>;
}

/// Hand-written transport doubles, kept public (not `cfg(test)`-gated) so
/// both in-crate unit tests and the root `tests/` integration suite can use
/// them without pulling in a mocking crate.
pub mod test_support {
    use super::*;
    use tokio::sync::{mpsc, Mutex};

    /// A transport double that records nothing and always succeeds —
    /// useful where a test only needs *a* valid sink, not its history.
    #[derive(Default)]
    pub struct NullTransport {
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn send_json(&self, _value: &Value) -> Result<(), String> {
            if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
                return Err("closed".into());
            }
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        async fn client_state(&self) -> ClientState {
            if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
                ClientState::Closed
            } else {
                ClientState::Open
            }
        }
    }

    /// A transport double backed by an mpsc channel, so tests can assert on
    /// exactly what was sent and simulate transient/permanent failures.
    pub struct ChannelTransport {
        tx: mpsc::UnboundedSender<Value>,
        state: Mutex<ClientState>,
        fail_next_n: std::sync::atomic::AtomicU32,
        permanent_failure: std::sync::atomic::AtomicBool,
    }

    impl ChannelTransport {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    tx,
                    state: Mutex::new(ClientState::Open),
                    fail_next_n: std::sync::atomic::AtomicU32::new(0),
                    permanent_failure: std::sync::atomic::AtomicBool::new(false),
                },
                rx,
            )
        }

        /// Make the next `n` sends fail with a transient error.
        pub fn fail_next(&self, n: u32) {
            self.fail_next_n.store(n, std::sync::atomic::Ordering::SeqCst);
        }

        /// Make every future send fail with a permanent error.
        pub fn fail_permanently(&self) {
            self.permanent_failure.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send_json(&self, value: &Value) -> Result<(), String> {
            if *self.state.lock().await == ClientState::Closed {
                return Err("send after close".into());
            }
            if self.permanent_failure.load(std::sync::atomic::Ordering::SeqCst) {
                return Err("permanent: payload rejected".into());
            }
            let remaining = self.fail_next_n.load(std::sync::atomic::Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next_n.store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
                return Err("transient: simulated failure".into());
            }
            self.tx.send(value.clone()).map_err(|e| format!("permanent: {e}"))
        }

        async fn close(&self) {
            *self.state.lock().await = ClientState::Closed;
        }

        async fn client_state(&self) -> ClientState {
            *self.state.lock().await
        }
    }

}

#[cfg(test)]
mod tests {
    use super::test_support::ChannelTransport;
    use super::*;

    #[tokio::test]
    async fn channel_transport_delivers_sent_values() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send_json(&serde_json::json!({"hello": "world"})).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn channel_transport_rejects_sends_after_close() {
        let (transport, _rx) = ChannelTransport::new();
        transport.close().await;
        let result = transport.send_json(&serde_json::json!(1)).await;
        assert!(result.is_err());
        assert_eq!(transport.client_state().await, ClientState::Closed);
    }

    #[tokio::test]
    async fn channel_transport_simulates_transient_then_recovers() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.fail_next(2);
        assert!(transport.send_json(&serde_json::json!(1)).await.is_err());
        assert!(transport.send_json(&serde_json::json!(2)).await.is_err());
        transport.send_json(&serde_json::json!(3)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), serde_json::json!(3));
    }
}
