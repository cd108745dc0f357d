//! Configuration for the registry, connection manager, and bridge.
//!
//! These structs are intentionally minimal, following
//! [`CloudLLMConfig`](https://docs.rs/cloudllm)'s philosophy: users
//! construct them directly, there is no TOML/YAML/env-var loader built
//! into the core, and `Default` gives sane production values.

use std::time::Duration;

/// Configuration for the [`ThreadRunRegistry`](crate::wsrouter::registry::ThreadRunRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Mappings are considered expired this long after `last_accessed_at`.
    pub mapping_ttl: Duration,
    /// Period of the background sweep.
    pub cleanup_interval: Duration,
    /// Soft capacity used only for memory-pressure metrics.
    pub max_mappings: usize,
    /// Verbose lookup/miss tracing. Off in production by default.
    pub enable_debug_logging: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mapping_ttl: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(30 * 60),
            max_mappings: 10_000,
            enable_debug_logging: false,
        }
    }
}

/// Configuration for the [`ConnectionManager`](crate::wsrouter::connection_manager::ConnectionManager).
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Capacity of each user's failed-delivery recovery queue.
    pub max_failed_queue: usize,
    /// Number of retry attempts for a single `send_message` call chain
    /// before the message is promoted to the failed-delivery queue.
    pub max_retries: u32,
    /// Base for the exponential retry backoff: `base * 2^n` seconds.
    pub retry_backoff_base: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            max_failed_queue: 10,
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(100),
        }
    }
}

/// Configuration for the [`Bridge`](crate::wsrouter::bridge::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Timeout for `initialize`'s dependency verification step.
    pub init_timeout: Duration,
    /// Interval of the background health-monitor probe.
    pub health_check_interval: Duration,
    /// Base delay for `attempt_recovery`'s exponential backoff.
    pub recovery_backoff_base: Duration,
    /// Maximum recovery backoff delay.
    pub recovery_backoff_max: Duration,
    /// Maximum number of recovery attempts per degradation.
    pub max_recovery_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            recovery_backoff_base: Duration::from_secs(1),
            recovery_backoff_max: Duration::from_secs(10),
            max_recovery_attempts: 3,
        }
    }
}
