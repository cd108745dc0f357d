// src/lib.rs

pub mod wsrouter;

pub use wsrouter::bridge::{Bridge, BridgeState};
pub use wsrouter::config::{BridgeConfig, ConnectionManagerConfig, RegistryConfig};
pub use wsrouter::connection::{Connection, ConnectionState};
pub use wsrouter::connection_manager::ConnectionManager;
pub use wsrouter::error::WsRouterError;
pub use wsrouter::event::{build_envelope, BusinessEvent, Envelope, EventType, RoutingIds};
pub use wsrouter::registry::{RegistryMetrics, RegistryStatus, RunMapping, ThreadRunRegistry};
pub use wsrouter::runid;
pub use wsrouter::serialize::serialize_safely;
pub use wsrouter::transport::{ClientState, Orchestrator, Transport};
