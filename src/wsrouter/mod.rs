//! Agent-to-user real-time event routing core.
//!
//! Four collaborators, wired in the order an embedder typically constructs
//! them: [`runid`] derives run identifiers, [`registry`] maps them to
//! threads, [`connection_manager`] owns the live per-user connections those
//! threads route to, and [`bridge`] is the single entry point an agent
//! runtime calls to get an event in front of a user.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod event;
pub mod registry;
pub mod runid;
pub mod serialize;
pub mod transport;

#[cfg(feature = "axum-transport")]
pub mod axum_transport;
