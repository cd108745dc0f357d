//! Thread↔Run Registry — the in-process SSOT for thread-to-run mappings.
//!
//! Grounded on `netra_backend/app/services/thread_run_registry.py`'s
//! `ThreadRunRegistry`: a bidirectional, TTL-bounded map with a background
//! sweep, ported from an `asyncio.Lock`-guarded singleton to an explicit,
//! constructible value per [`DESIGN.md`](../../../DESIGN.md)'s decision on
//! global singletons.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::wsrouter::config::RegistryConfig;

/// Lifecycle state of a [`RunMapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingState {
    Active,
    Expired,
    CleanupPending,
}

/// A single thread-to-run mapping and its access history.
#[derive(Debug, Clone, Serialize)]
pub struct RunMapping {
    pub run_id: String,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub state: MappingState,
    pub metadata: HashMap<String, Value>,
}

impl RunMapping {
    fn new(run_id: String, thread_id: String, metadata: HashMap<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            thread_id,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            state: MappingState::Active,
            metadata,
        }
    }

    fn is_expired(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.last_accessed_at > ttl
    }

    /// Recompute `state` from the current TTL check, returning whether the
    /// mapping is now expired. Called at every access and sweep point so
    /// `state` never drifts from what `is_expired` would say on its own.
    fn sync_state(&mut self, ttl: chrono::Duration) -> bool {
        let expired = self.is_expired(ttl);
        self.state = if expired { MappingState::Expired } else { MappingState::Active };
        expired
    }
}

/// Point-in-time snapshot of registry performance counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryMetrics {
    pub active_mappings: usize,
    pub total_registrations: u64,
    pub successful_lookups: u64,
    pub failed_lookups: u64,
    pub lookup_success_rate: f64,
    pub expired_mappings_cleaned: u64,
    pub uptime_seconds: f64,
    pub memory_usage_percentage: f64,
    pub last_cleanup: DateTime<Utc>,
    pub registry_healthy: bool,
}

/// Higher-level status summary layering config and cleanup-task health onto
/// [`RegistryMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub metrics: RegistryMetrics,
    pub cleanup_task_running: bool,
    pub mapping_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub max_mappings: usize,
}

struct Indices {
    run_to_thread: HashMap<String, RunMapping>,
    thread_to_runs: HashMap<String, HashSet<String>>,
}

impl Indices {
    fn new() -> Self {
        Self {
            run_to_thread: HashMap::new(),
            thread_to_runs: HashMap::new(),
        }
    }

    /// Detach `run_id` from both indices. Returns the removed mapping, if any.
    fn remove(&mut self, run_id: &str) -> Option<RunMapping> {
        let mapping = self.run_to_thread.remove(run_id)?;
        if let Some(runs) = self.thread_to_runs.get_mut(&mapping.thread_id) {
            runs.remove(run_id);
            if runs.is_empty() {
                self.thread_to_runs.remove(&mapping.thread_id);
            }
        }
        Some(mapping)
    }

    fn insert(&mut self, mapping: RunMapping) {
        // Re-registering an existing run_id under a new thread must detach
        // it from the old thread's reverse set first.
        if let Some(old) = self.run_to_thread.get(&mapping.run_id) {
            if old.thread_id != mapping.thread_id {
                if let Some(runs) = self.thread_to_runs.get_mut(&old.thread_id) {
                    runs.remove(&mapping.run_id);
                    if runs.is_empty() {
                        self.thread_to_runs.remove(&old.thread_id);
                    }
                }
            }
        }
        self.thread_to_runs
            .entry(mapping.thread_id.clone())
            .or_default()
            .insert(mapping.run_id.clone());
        self.run_to_thread.insert(mapping.run_id.clone(), mapping);
    }
}

#[derive(Default)]
struct Counters {
    total_registrations: AtomicU64,
    successful_lookups: AtomicU64,
    failed_lookups: AtomicU64,
    expired_mappings_cleaned: AtomicU64,
}

/// Bidirectional, TTL-bounded thread↔run registry.
///
/// The single [`Mutex`] guarding [`Indices`] is the entire concurrency
/// story: every public operation acquires it for the minimum scope needed.
pub struct ThreadRunRegistry {
    config: RegistryConfig,
    indices: Arc<Mutex<Indices>>,
    counters: Arc<Counters>,
    last_cleanup: Arc<Mutex<DateTime<Utc>>>,
    shutdown: Arc<AtomicBool>,
    start: Instant,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadRunRegistry {
    /// Construct a registry and spawn its background cleanup task.
    pub fn new(config: RegistryConfig) -> Self {
        let indices = Arc::new(Mutex::new(Indices::new()));
        let counters = Arc::new(Counters::default());
        let last_cleanup = Arc::new(Mutex::new(Utc::now()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = spawn_cleanup_loop(
            config.clone(),
            Arc::clone(&indices),
            Arc::clone(&counters),
            Arc::clone(&last_cleanup),
            Arc::clone(&shutdown),
        );

        log::info!(
            "ThreadRunRegistry initialized ttl={:?} cleanup_interval={:?}",
            config.mapping_ttl,
            config.cleanup_interval
        );

        Self {
            config,
            indices,
            counters,
            last_cleanup,
            shutdown,
            start: Instant::now(),
            cleanup_handle: Mutex::new(Some(handle)),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Register a run_id↔thread_id mapping, replacing any prior mapping for
    /// the same run_id. Returns `false` (no mutation) on invalid arguments
    /// or if the registry has been shut down.
    pub async fn register(
        &self,
        run_id: &str,
        thread_id: &str,
        metadata: Option<HashMap<String, Value>>,
    ) -> bool {
        if self.is_shutdown() {
            return false;
        }
        if run_id.is_empty() || thread_id.is_empty() || thread_id.contains(crate::wsrouter::runid::RUN_ID_SEPARATOR) {
            log::error!("invalid register call: run_id={run_id:?} thread_id={thread_id:?}");
            return false;
        }

        let mapping = RunMapping::new(run_id.to_string(), thread_id.to_string(), metadata.unwrap_or_default());

        let mut indices = self.indices.lock().await;
        indices.insert(mapping);
        drop(indices);

        self.counters.total_registrations.fetch_add(1, Ordering::Relaxed);

        if self.config.enable_debug_logging {
            log::info!("registered run_id={run_id} -> thread_id={thread_id}");
        }
        true
    }

    /// Look up the thread id for a run id, refreshing `last_accessed_at` on
    /// a hit. Returns `None` on miss, on TTL expiry, or after shutdown.
    pub async fn get_thread(&self, run_id: &str) -> Option<String> {
        if self.is_shutdown() {
            return None;
        }

        let ttl = chrono::Duration::from_std(self.config.mapping_ttl).unwrap_or(chrono::Duration::zero());
        let mut indices = self.indices.lock().await;

        let Some(mapping) = indices.run_to_thread.get_mut(run_id) else {
            drop(indices);
            self.counters.failed_lookups.fetch_add(1, Ordering::Relaxed);
            if self.config.enable_debug_logging {
                log::debug!("lookup miss: run_id={run_id}");
            }
            return None;
        };

        if mapping.sync_state(ttl) {
            drop(indices);
            self.counters.failed_lookups.fetch_add(1, Ordering::Relaxed);
            if self.config.enable_debug_logging {
                log::debug!("lookup expired: run_id={run_id}");
            }
            return None;
        }

        mapping.last_accessed_at = Utc::now();
        mapping.access_count += 1;
        let thread_id = mapping.thread_id.clone();
        drop(indices);

        self.counters.successful_lookups.fetch_add(1, Ordering::Relaxed);
        if self.config.enable_debug_logging {
            log::debug!("lookup success: run_id={run_id} -> thread_id={thread_id}");
        }
        Some(thread_id)
    }

    /// List the non-expired run ids registered for `thread_id`. Does not
    /// refresh access timestamps of the returned mappings, but does sync
    /// each mapping's `state` to its current TTL check.
    pub async fn get_runs(&self, thread_id: &str) -> Vec<String> {
        if self.is_shutdown() {
            return Vec::new();
        }
        let ttl = chrono::Duration::from_std(self.config.mapping_ttl).unwrap_or(chrono::Duration::zero());
        let mut indices = self.indices.lock().await;
        let run_ids: Vec<String> = match indices.thread_to_runs.get(thread_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let mut live = Vec::new();
        for run_id in run_ids {
            if let Some(mapping) = indices.run_to_thread.get_mut(&run_id) {
                if !mapping.sync_state(ttl) {
                    live.push(run_id);
                }
            }
        }
        live
    }

    /// Remove a run_id mapping from both indices. Returns `true` if a
    /// mapping was removed.
    pub async fn unregister_run(&self, run_id: &str) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let mut indices = self.indices.lock().await;
        let removed = indices.remove(run_id).is_some();
        drop(indices);
        if removed && self.config.enable_debug_logging {
            log::info!("unregistered run_id={run_id}");
        }
        removed
    }

    /// Sweep expired mappings. Returns the number removed. Never raises —
    /// any mapping whose age cannot be established cleanly is simply
    /// treated as expired and removed.
    pub async fn cleanup_old_mappings(&self) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        let ttl = chrono::Duration::from_std(self.config.mapping_ttl).unwrap_or(chrono::Duration::zero());
        let mut indices = self.indices.lock().await;
        let expired: Vec<String> = indices
            .run_to_thread
            .iter()
            .filter(|(_, m)| m.is_expired(ttl))
            .map(|(run_id, _)| run_id.clone())
            .collect();

        for run_id in &expired {
            if let Some(mapping) = indices.run_to_thread.get_mut(run_id) {
                mapping.state = MappingState::CleanupPending;
            }
        }
        let count = expired.len();
        for run_id in &expired {
            indices.remove(run_id);
        }
        drop(indices);

        if count > 0 {
            self.counters
                .expired_mappings_cleaned
                .fetch_add(count as u64, Ordering::Relaxed);
            log::info!("cleanup removed {count} expired mappings");
        } else if self.config.enable_debug_logging {
            log::debug!("cleanup found no expired mappings");
        }

        *self.last_cleanup.lock().await = Utc::now();
        count
    }

    /// Snapshot of registry performance counters. Never fails; after
    /// shutdown, `registry_healthy` is `false` and counters reflect the
    /// state at the moment of shutdown.
    pub async fn get_metrics(&self) -> RegistryMetrics {
        let active_mappings = self.indices.lock().await.run_to_thread.len();
        let successful = self.counters.successful_lookups.load(Ordering::Relaxed);
        let failed = self.counters.failed_lookups.load(Ordering::Relaxed);
        let total_lookups = successful + failed;
        let lookup_success_rate = if total_lookups > 0 {
            successful as f64 / total_lookups as f64
        } else {
            1.0
        };

        RegistryMetrics {
            active_mappings,
            total_registrations: self.counters.total_registrations.load(Ordering::Relaxed),
            successful_lookups: successful,
            failed_lookups: failed,
            lookup_success_rate,
            expired_mappings_cleaned: self.counters.expired_mappings_cleaned.load(Ordering::Relaxed),
            uptime_seconds: self.start.elapsed().as_secs_f64(),
            memory_usage_percentage: active_mappings as f64 / self.config.max_mappings as f64 * 100.0,
            last_cleanup: *self.last_cleanup.lock().await,
            registry_healthy: !self.is_shutdown(),
        }
    }

    /// A status view nesting config and cleanup task health onto
    /// [`get_metrics`](Self::get_metrics).
    pub async fn get_status(&self) -> RegistryStatus {
        let metrics = self.get_metrics().await;
        let cleanup_task_running = match self.cleanup_handle.lock().await.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        };
        RegistryStatus {
            metrics,
            cleanup_task_running,
            mapping_ttl_seconds: self.config.mapping_ttl.as_secs(),
            cleanup_interval_seconds: self.config.cleanup_interval.as_secs(),
            max_mappings: self.config.max_mappings,
        }
    }

    /// Diagnostic-only dump of every mapping currently held.
    pub async fn debug_list_all_mappings(&self) -> Vec<RunMapping> {
        self.indices.lock().await.run_to_thread.values().cloned().collect()
    }

    /// Mark the registry shut down, cancel the cleanup task (bounded to a
    /// 3-second join), and clear both indices.
    pub async fn shutdown(&self) {
        log::info!("shutting down ThreadRunRegistry");
        self.shutdown.store(true, Ordering::Release);

        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            handle.abort();
            let _ = tokio::time::timeout(std::time::Duration::from_secs(3), handle).await;
        }

        let mut indices = self.indices.lock().await;
        indices.run_to_thread.clear();
        indices.thread_to_runs.clear();
        log::info!("ThreadRunRegistry shutdown complete");
    }
}

fn spawn_cleanup_loop(
    config: RegistryConfig,
    indices: Arc<Mutex<Indices>>,
    counters: Arc<Counters>,
    last_cleanup: Arc<Mutex<DateTime<Utc>>>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::debug!("background cleanup loop started");
        let ttl = chrono::Duration::from_std(config.mapping_ttl).unwrap_or(chrono::Duration::zero());

        'outer: while !shutdown.load(Ordering::Acquire) {
            let total_secs = config.cleanup_interval.as_secs().max(1);
            for _ in 0..total_secs {
                if shutdown.load(Ordering::Acquire) {
                    break 'outer;
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let swept = async {
                let mut guard = indices.lock().await;
                let expired: Vec<String> = guard
                    .run_to_thread
                    .iter()
                    .filter(|(_, m)| m.is_expired(ttl))
                    .map(|(run_id, _)| run_id.clone())
                    .collect();
                for run_id in &expired {
                    if let Some(mapping) = guard.run_to_thread.get_mut(run_id) {
                        mapping.state = MappingState::CleanupPending;
                    }
                }
                let count = expired.len();
                for run_id in &expired {
                    guard.remove(run_id);
                }
                count
            }
            .await;

            if swept > 0 {
                counters
                    .expired_mappings_cleaned
                    .fetch_add(swept as u64, Ordering::Relaxed);
                log::info!("cleanup cycle removed {swept} expired mappings");
            } else if config.enable_debug_logging {
                log::debug!("cleanup cycle: nothing expired");
            }
            *last_cleanup.lock().await = Utc::now();
        }
        log::debug!("background cleanup loop ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get_thread_round_trips() {
        let registry = ThreadRunRegistry::new(RegistryConfig::default());
        assert!(registry.register("rid_1", "thread_A", None).await);
        assert_eq!(registry.get_thread("rid_1").await.as_deref(), Some("thread_A"));
        assert_eq!(registry.get_runs("thread_A").await, vec!["rid_1".to_string()]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_invalid_arguments() {
        let registry = ThreadRunRegistry::new(RegistryConfig::default());
        assert!(!registry.register("", "thread_A", None).await);
        assert!(!registry.register("rid_1", "", None).await);
        assert!(!registry.register("rid_1", "has_run_in_it", None).await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn reregistering_detaches_from_old_thread() {
        let registry = ThreadRunRegistry::new(RegistryConfig::default());
        assert!(registry.register("rid_1", "thread_A", None).await);
        assert!(registry.register("rid_1", "thread_B", None).await);
        assert!(registry.get_runs("thread_A").await.is_empty());
        assert_eq!(registry.get_runs("thread_B").await, vec!["rid_1".to_string()]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unregister_cleans_empty_thread_entry() {
        let registry = ThreadRunRegistry::new(RegistryConfig::default());
        registry.register("rid_1", "thread_A", None).await;
        assert!(registry.unregister_run("rid_1").await);
        assert_eq!(registry.get_thread("rid_1").await, None);
        assert!(registry.get_runs("thread_A").await.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn ttl_sweep_expires_and_spares_fresh_mappings() {
        let mut config = RegistryConfig::default();
        config.mapping_ttl = std::time::Duration::from_millis(50);
        let registry = ThreadRunRegistry::new(config);

        registry.register("rid_1", "thread_A", None).await;
        registry.register("rid_2", "thread_B", None).await;
        registry.register("rid_3", "thread_C", None).await;

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        registry.register("rid_4", "thread_D", None).await;

        let cleaned = registry.cleanup_old_mappings().await;
        assert_eq!(cleaned, 3);
        assert_eq!(registry.get_thread("rid_1").await, None);
        assert_eq!(registry.get_thread("rid_4").await.as_deref(), Some("thread_D"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_track_lookup_outcomes() {
        let registry = ThreadRunRegistry::new(RegistryConfig::default());
        registry.register("rid_1", "thread_A", None).await;
        registry.get_thread("rid_1").await;
        registry.get_thread("missing").await;

        let metrics = registry.get_metrics().await;
        assert_eq!(metrics.active_mappings, 1);
        assert_eq!(metrics.total_registrations, 1);
        assert_eq!(metrics.successful_lookups, 1);
        assert_eq!(metrics.failed_lookups, 1);
        assert!((metrics.lookup_success_rate - 0.5).abs() < f64::EPSILON);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn operations_fail_gracefully_after_shutdown() {
        let registry = ThreadRunRegistry::new(RegistryConfig::default());
        registry.register("rid_1", "thread_A", None).await;
        registry.shutdown().await;

        assert!(!registry.register("rid_2", "thread_B", None).await);
        assert_eq!(registry.get_thread("rid_1").await, None);
        let metrics = registry.get_metrics().await;
        assert!(!metrics.registry_healthy);
    }

    #[tokio::test]
    async fn expired_mapping_state_reflects_ttl_before_sweep() {
        let mut config = RegistryConfig::default();
        config.mapping_ttl = std::time::Duration::from_millis(50);
        let registry = ThreadRunRegistry::new(config);

        registry.register("rid_1", "thread_A", None).await;
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;

        assert_eq!(registry.get_thread("rid_1").await, None);
        let mappings = registry.debug_list_all_mappings().await;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].state, MappingState::Expired);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_registrations_all_land() {
        let registry = Arc::new(ThreadRunRegistry::new(RegistryConfig::default()));
        let mut handles = Vec::new();
        for i in 0..1000 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.register(&format!("rid_{i}"), &format!("thread_{i}"), None).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let metrics = registry.get_metrics().await;
        assert_eq!(metrics.active_mappings, 1000);

        for i in 0..1000 {
            let thread = registry.get_thread(&format!("rid_{i}")).await;
            assert_eq!(thread, Some(format!("thread_{i}")));
        }
        let metrics = registry.get_metrics().await;
        assert!((metrics.lookup_success_rate - 1.0).abs() < f64::EPSILON);
        registry.shutdown().await;
    }
}
