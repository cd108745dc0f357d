//! Crate-wide error kinds.
//!
//! The error handling policy here is strict: every public hot-path
//! operation (`register`, `getThread`, `sendMessage`, `notify_*`) returns a
//! plain `bool`/`Option` and never raises. [`WsRouterError`] exists only
//! for the handful of operations where a documented, detailed failure
//! reason genuinely helps a caller — bridge initialization and health
//! checks — mirroring how sparingly `cloudllm::tool_protocol::ToolError`
//! is reached for over a bare bool/Option.

use std::fmt;

/// Error kinds surfaced by the few operations that return `Result`.
#[derive(Debug, Clone, PartialEq)]
pub enum WsRouterError {
    /// Caller passed a malformed run id, empty id, or wrong-typed value.
    InvalidArgument(String),
    /// A send was closed/disconnected/timed out and retries were exhausted.
    TransientTransport(String),
    /// The underlying sink rejected the payload after serialization.
    PermanentTransport(String),
    /// The orchestrator or registry reported itself unavailable.
    DependencyUnavailable(String),
    /// The bridge could not verify its dependencies during `initialize`.
    InitializationFailure(String),
    /// The operation was attempted after shutdown.
    Shutdown,
}

impl fmt::Display for WsRouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsRouterError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            WsRouterError::TransientTransport(msg) => write!(f, "transient transport error: {msg}"),
            WsRouterError::PermanentTransport(msg) => write!(f, "permanent transport error: {msg}"),
            WsRouterError::DependencyUnavailable(msg) => write!(f, "dependency unavailable: {msg}"),
            WsRouterError::InitializationFailure(msg) => write!(f, "initialization failure: {msg}"),
            WsRouterError::Shutdown => write!(f, "operation attempted after shutdown"),
        }
    }
}

impl std::error::Error for WsRouterError {}
