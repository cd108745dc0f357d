//! A concrete [`Transport`] backed by an `axum` WebSocket, for embedders who
//! don't want to hand-write the trait against their own stack.
//!
//! Gated behind the `axum-transport` feature, mirroring how
//! `cloudllm::mcp_http_adapter::AxumHttpAdapter` gates its own Axum-based
//! HTTP adapter behind `mcp-server`. The handshake itself —
//! upgrading the HTTP request, running auth — stays the embedder's
//! responsibility; this type only implements the send/close/state surface
//! once a `WebSocket` already exists.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::wsrouter::transport::{ClientState, Transport};

/// Wraps the sender half of a split `axum` `WebSocket`.
pub struct AxumWebSocketTransport {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    closed: Mutex<bool>,
}

impl AxumWebSocketTransport {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self { sender: Mutex::new(sender), closed: Mutex::new(false) }
    }
}

#[async_trait]
impl Transport for AxumWebSocketTransport {
    async fn send_json(&self, value: &Value) -> Result<(), String> {
        if *self.closed.lock().await {
            return Err("permanent: send after close".to_string());
        }
        let text = serde_json::to_string(value).map_err(|e| format!("permanent: {e}"))?;
        let mut sender = self.sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| format!("transient: {e}"))
    }

    async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        let _ = self.sender.lock().await.send(Message::Close(None)).await;
    }

    async fn client_state(&self) -> ClientState {
        if *self.closed.lock().await {
            ClientState::Closed
        } else {
            ClientState::Open
        }
    }
}
