//! The agent-to-WebSocket bridge: resolves a run id to a thread, stamps
//! routing identifiers onto an envelope, and delegates delivery to the
//! [`ConnectionManager`].
//!
//! Grounded on `agent_communication.py`'s mixin (one `notify_*` method per
//! event type, all funnelling through a single send path) and on the
//! state-machine idiom of `cloudllm::mcp_server::UnifiedMcpServer` and
//! `cloudllm::orchestration::Orchestration`: an explicit state enum guarded
//! by a single lock, a background monitor task, and a bounded-backoff
//! recovery routine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::wsrouter::config::BridgeConfig;
use crate::wsrouter::connection_manager::ConnectionManager;
use crate::wsrouter::error::WsRouterError;
use crate::wsrouter::event::{build_envelope, BusinessEvent, RoutingIds};
use crate::wsrouter::registry::ThreadRunRegistry;
use crate::wsrouter::runid;
use crate::wsrouter::transport::Orchestrator;

/// Lifecycle of the bridge itself, independent of any single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Initializing,
    Active,
    /// Two consecutive failed health probes. Notifications are refused
    /// until [`Bridge::attempt_recovery`] (run automatically by the
    /// background monitor) brings the bridge back to `Active`.
    Degraded,
    Shutdown,
}

/// Resolves run ids to threads and routes agent events to a user's live
/// connections.
pub struct Bridge {
    config: BridgeConfig,
    state: RwLock<BridgeState>,
    connection_manager: Arc<ConnectionManager>,
    registry: Arc<ThreadRunRegistry>,
    orchestrator: RwLock<Option<Arc<dyn Orchestrator>>>,
    consecutive_health_failures: AtomicU32,
    monitor_handle: RwLock<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(connection_manager: Arc<ConnectionManager>, registry: Arc<ThreadRunRegistry>, config: BridgeConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BridgeState::Uninitialized),
            connection_manager,
            registry,
            orchestrator: RwLock::new(None),
            consecutive_health_failures: AtomicU32::new(0),
            monitor_handle: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    /// Verify dependencies, record the optional orchestrator callback, and
    /// start the background health monitor. Only callable from
    /// `Uninitialized`.
    pub async fn initialize(self: &Arc<Self>, orchestrator: Option<Arc<dyn Orchestrator>>) -> Result<(), WsRouterError> {
        {
            let mut state = self.state.write().await;
            if *state != BridgeState::Uninitialized {
                return Err(WsRouterError::InitializationFailure("bridge already initialized".into()));
            }
            *state = BridgeState::Initializing;
        }

        let verified = tokio::time::timeout(self.config.init_timeout, async {
            self.registry.get_metrics().await;
            self.connection_manager.get_connection_count().await;
        })
        .await;
        if verified.is_err() {
            let mut state = self.state.write().await;
            *state = BridgeState::Uninitialized;
            return Err(WsRouterError::InitializationFailure("dependency verification timed out".into()));
        }

        *self.orchestrator.write().await = orchestrator;
        *self.state.write().await = BridgeState::Active;

        let handle = spawn_health_monitor(Arc::clone(self));
        *self.monitor_handle.write().await = Some(handle);
        log::info!("bridge initialized");
        Ok(())
    }

    /// Registry -> orchestrator callback -> pattern extraction -> `None`.
    pub async fn resolve_thread_id(&self, run_id: &str) -> Option<String> {
        self.resolve_thread_id_inner(run_id, true).await
    }

    async fn resolve_thread_id_inner(&self, run_id: &str, consult_registry: bool) -> Option<String> {
        if consult_registry {
            if let Some(thread_id) = self.registry.get_thread(run_id).await {
                return Some(thread_id);
            }
        }
        if let Some(orchestrator) = self.orchestrator.read().await.as_ref() {
            if let Some(thread_id) = orchestrator.get_thread_id_for_run(run_id).await {
                return Some(thread_id);
            }
        }
        runid::extract_thread_id(run_id)
    }

    /// Resolve `run_id`'s thread, build the envelope, and deliver it to
    /// `user_id` through the connection manager. Critical events are
    /// queued for recovery rather than dropped if the user has no live
    /// connection.
    ///
    /// While `Degraded`, delivery is still attempted but fails fast: the
    /// registry hop is skipped (it may be the dependency that's down) in
    /// favor of going straight to the orchestrator callback and pattern
    /// extraction.
    pub async fn notify(&self, run_id: &str, user_id: &str, event: BusinessEvent) -> bool {
        let state = *self.state.read().await;
        if !matches!(state, BridgeState::Active | BridgeState::Degraded) {
            log::warn!("bridge not active, dropping notification for run {run_id}");
            return false;
        }
        if state == BridgeState::Degraded {
            log::debug!("bridge degraded, resolving run {run_id} without the registry hop");
        }
        let thread_id = self.resolve_thread_id_inner(run_id, state != BridgeState::Degraded).await;
        let critical = event.is_critical();
        let envelope = build_envelope(
            event,
            RoutingIds { run_id: Some(run_id.to_string()), thread_id, user_id: Some(user_id.to_string()) },
        );
        if critical {
            self.connection_manager.emit_critical_event(user_id, &envelope).await
        } else {
            self.connection_manager.send_to_user(user_id, &envelope).await > 0
        }
    }

    pub async fn notify_agent_started(&self, run_id: &str, user_id: &str, thread_id: &str, agent_name: &str) -> bool {
        self.notify(
            run_id,
            user_id,
            BusinessEvent::AgentStarted {
                user_id: user_id.to_string(),
                thread_id: thread_id.to_string(),
                agent_name: agent_name.to_string(),
            },
        )
        .await
    }

    pub async fn notify_agent_thinking(&self, run_id: &str, user_id: &str, reasoning: &str, agent_name: &str, step_number: Option<u64>) -> bool {
        self.notify(
            run_id,
            user_id,
            BusinessEvent::AgentThinking { reasoning: reasoning.to_string(), agent_name: agent_name.to_string(), step_number },
        )
        .await
    }

    pub async fn notify_tool_executing(&self, run_id: &str, user_id: &str, tool_name: &str, tool_args: serde_json::Value, execution_id: &str) -> bool {
        self.notify(
            run_id,
            user_id,
            BusinessEvent::ToolExecuting { tool_name: tool_name.to_string(), tool_args, execution_id: execution_id.to_string() },
        )
        .await
    }

    pub async fn notify_tool_completed(&self, run_id: &str, user_id: &str, tool_name: &str, results: serde_json::Value, execution_time: f64) -> bool {
        self.notify(
            run_id,
            user_id,
            BusinessEvent::ToolCompleted { tool_name: tool_name.to_string(), results, execution_time },
        )
        .await
    }

    pub async fn notify_agent_completed(&self, run_id: &str, user_id: &str, status: &str, final_response: &str, duration_ms: Option<u64>) -> bool {
        self.notify(
            run_id,
            user_id,
            BusinessEvent::AgentCompleted { status: status.to_string(), final_response: final_response.to_string(), duration_ms },
        )
        .await
    }

    pub async fn notify_progress_update(&self, run_id: &str, user_id: &str, percentage: f64, message: &str) -> bool {
        self.notify(run_id, user_id, BusinessEvent::ProgressUpdate { percentage, message: message.to_string() }).await
    }

    pub async fn notify_error(&self, run_id: &str, user_id: &str, error_code: &str, message: &str) -> bool {
        self.notify(run_id, user_id, BusinessEvent::Error { error_code: error_code.to_string(), message: message.to_string() }).await
    }

    pub async fn notify_connection_status(&self, run_id: &str, user_id: &str, status: &str) -> bool {
        self.notify(run_id, user_id, BusinessEvent::ConnectionStatus { status: status.to_string() }).await
    }

    /// Probe that both collaborators still answer. Two consecutive
    /// failures demote the bridge to `Degraded`.
    pub async fn health_check(&self) -> bool {
        let healthy = self.registry.get_metrics().await.registry_healthy;
        if healthy {
            self.consecutive_health_failures.store(0, Ordering::SeqCst);
            let mut state = self.state.write().await;
            if *state == BridgeState::Degraded {
                *state = BridgeState::Active;
                log::info!("bridge recovered to Active");
            }
            true
        } else {
            let failures = self.consecutive_health_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= 2 {
                let mut state = self.state.write().await;
                if *state == BridgeState::Active {
                    *state = BridgeState::Degraded;
                    log::warn!("bridge degraded after {failures} consecutive failed health probes");
                }
            }
            false
        }
    }

    /// Retry [`health_check`](Self::health_check) with exponential backoff,
    /// capped at `recovery_backoff_max`, up to `max_recovery_attempts`.
    pub async fn attempt_recovery(&self) -> bool {
        let mut delay = self.config.recovery_backoff_base;
        for attempt in 0..self.config.max_recovery_attempts {
            if self.health_check().await {
                return true;
            }
            log::debug!("recovery attempt {attempt} failed, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, self.config.recovery_backoff_max);
        }
        false
    }

    pub async fn shutdown(&self) {
        *self.state.write().await = BridgeState::Shutdown;
        if let Some(handle) = self.monitor_handle.write().await.take() {
            handle.abort();
        }
    }
}

fn spawn_health_monitor(bridge: Arc<Bridge>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(bridge.config.health_check_interval).await;
            if matches!(bridge.state().await, BridgeState::Shutdown) {
                break;
            }
            if !bridge.health_check().await && matches!(bridge.state().await, BridgeState::Degraded) {
                bridge.attempt_recovery().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wsrouter::config::{ConnectionManagerConfig, RegistryConfig};
    use crate::wsrouter::transport::test_support::ChannelTransport;

    struct StaticOrchestrator(Option<String>);

    #[async_trait::async_trait]
    impl Orchestrator for StaticOrchestrator {
        async fn get_thread_id_for_run(&self, _run_id: &str) -> Option<String> {
            self.0.clone()
        }
    }

    async fn bridge() -> Arc<Bridge> {
        let connection_manager = Arc::new(ConnectionManager::new(ConnectionManagerConfig::default()));
        let registry = Arc::new(ThreadRunRegistry::new(RegistryConfig::default()));
        let bridge = Arc::new(Bridge::new(connection_manager, registry, BridgeConfig {
            health_check_interval: std::time::Duration::from_secs(3600),
            ..BridgeConfig::default()
        }));
        bridge.initialize(None).await.unwrap();
        bridge
    }

    #[tokio::test]
    async fn resolution_prefers_registry_over_orchestrator_and_pattern() {
        let bridge = bridge().await;
        bridge.registry.register("thread_t1_run_100_abcd1234", "t1", None).await;
        let thread = bridge.resolve_thread_id("thread_t1_run_100_abcd1234").await;
        assert_eq!(thread, Some("t1".to_string()));
    }

    #[tokio::test]
    async fn resolution_falls_back_to_orchestrator_then_pattern() {
        let connection_manager = Arc::new(ConnectionManager::new(ConnectionManagerConfig::default()));
        let registry = Arc::new(ThreadRunRegistry::new(RegistryConfig::default()));
        let bridge = Arc::new(Bridge::new(connection_manager, registry, BridgeConfig::default()));
        bridge.initialize(Some(Arc::new(StaticOrchestrator(Some("from_orchestrator".into()))))).await.unwrap();
        let thread = bridge.resolve_thread_id("unregistered_run_id").await;
        assert_eq!(thread, Some("from_orchestrator".to_string()));

        let bridge2 = Arc::new(Bridge::new(
            Arc::new(ConnectionManager::new(ConnectionManagerConfig::default())),
            Arc::new(ThreadRunRegistry::new(RegistryConfig::default())),
            BridgeConfig::default(),
        ));
        bridge2.initialize(None).await.unwrap();
        let thread = bridge2.resolve_thread_id("thread_t2_run_100_abcd1234").await;
        assert_eq!(thread, Some("t2".to_string()));
    }

    #[tokio::test]
    async fn notify_delivers_to_users_ready_connection() {
        let bridge = bridge().await;
        let (transport, mut rx) = ChannelTransport::new();
        bridge.connection_manager.add_connection("c1", "u1", Arc::new(transport)).await;
        bridge.connection_manager.mark_connection_ready("c1").await;
        assert!(bridge.notify_agent_started("thread_t1_run_1_abcd1234", "u1", "t1", "Analyzer").await);
        let received = rx.recv().await.unwrap();
        assert_eq!(received["type"], serde_json::json!("agent_started"));
    }

    #[tokio::test]
    async fn health_check_degrades_after_two_failures_and_recovers() {
        let bridge = bridge().await;
        bridge.registry.shutdown().await;
        assert!(!bridge.health_check().await);
        assert_eq!(bridge.state().await, BridgeState::Active);
        assert!(!bridge.health_check().await);
        assert_eq!(bridge.state().await, BridgeState::Degraded);
    }

    #[tokio::test]
    async fn degraded_bridge_still_delivers_to_connected_users() {
        let bridge = bridge().await;
        let (transport, mut rx) = ChannelTransport::new();
        bridge.connection_manager.add_connection("c1", "u1", Arc::new(transport)).await;
        bridge.connection_manager.mark_connection_ready("c1").await;

        bridge.registry.shutdown().await;
        assert!(!bridge.health_check().await);
        assert!(!bridge.health_check().await);
        assert_eq!(bridge.state().await, BridgeState::Degraded);

        assert!(bridge.notify_progress_update("thread_t1_run_1_abcd1234", "u1", 50.0, "halfway").await);
        let received = rx.recv().await.unwrap();
        assert_eq!(received["type"], serde_json::json!("progress_update"));
    }

    #[tokio::test]
    async fn inactive_bridge_refuses_notifications() {
        let connection_manager = Arc::new(ConnectionManager::new(ConnectionManagerConfig::default()));
        let registry = Arc::new(ThreadRunRegistry::new(RegistryConfig::default()));
        let bridge = Arc::new(Bridge::new(connection_manager, registry, BridgeConfig::default()));
        assert!(!bridge.notify_progress_update("thread_t1_run_1_abcd1234", "u1", 50.0, "halfway").await);
    }
}
