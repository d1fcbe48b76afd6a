//! Unified cache manager.
//!
//! One façade over the cache and whichever warming engine is active. The
//! engine is picked once at construction:
//!
//! - `Legacy`: local [`CacheWarmer`].
//! - `Integrated`: [`DistributedJobRouter`] over the configured job queue.
//!   Without a queue this falls back to `Legacy`.
//! - `Auto`: probe the job queue; `Integrated` if it answers within the probe
//!   timeout, `Legacy` otherwise.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{Cache, CacheExt, CacheStats};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::{CacheSettings, WarmingMode};
use crate::distributed::{DeadLetterEntry, DistributedJobRouter, JobQueue, QueueSizes, RouterSettings};
use crate::engine::{ActiveEngine, EngineStats, PendingJob, WarmupEngine};
use crate::error::{CacheError, CacheResult};
use crate::job::WarmupJob;
use crate::warmer::{CacheWarmer, WarmupStrategy};

/// TTL of entries enqueued through [`UnifiedCacheManager::enqueue_batch_warmup_job`].
pub const BATCH_WARMUP_TTL: Duration = Duration::from_secs(3600);

const USER_DATA_PRIORITY: i32 = 2;
const POPULAR_CONTENT_PRIORITY: i32 = 1;
const PERIODIC_WARMUP_PRIORITY: i32 = 3;

/// Everything the manager needs to build its engine.
#[derive(Clone)]
pub struct CacheWarmingConfig {
    pub mode: WarmingMode,
    /// Backend for `Integrated` mode.
    pub job_queue: Option<Arc<dyn JobQueue>>,
    pub strategy: WarmupStrategy,
    pub router: RouterSettings,
    /// Breaker guarding job queue calls.
    pub queue_breaker: CircuitBreakerConfig,
    /// Liveness probe budget for `Auto` mode.
    pub probe_timeout: Duration,
}

impl Default for CacheWarmingConfig {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default(), None)
    }
}

impl CacheWarmingConfig {
    pub fn from_settings(settings: &CacheSettings, job_queue: Option<Arc<dyn JobQueue>>) -> Self {
        Self {
            mode: settings.warming.mode,
            job_queue,
            strategy: WarmupStrategy::from_config(&settings.warming),
            router: RouterSettings::from_config(&settings.warming),
            queue_breaker: settings.circuit_breaker.clone(),
            probe_timeout: settings.warming.probe_timeout(),
        }
    }

    pub fn with_mode(mut self, mode: WarmingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_job_queue(mut self, job_queue: Arc<dyn JobQueue>) -> Self {
        self.job_queue = Some(job_queue);
        self
    }

    pub fn with_strategy(mut self, strategy: WarmupStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

async fn detect_mode(config: &CacheWarmingConfig) -> WarmingMode {
    match (config.mode, &config.job_queue) {
        (WarmingMode::Legacy, _) => WarmingMode::Legacy,
        (WarmingMode::Integrated, Some(_)) => WarmingMode::Integrated,
        (WarmingMode::Integrated, None) => {
            warn!("integrated warming requested without a job queue, falling back to legacy");
            WarmingMode::Legacy
        }
        (WarmingMode::Auto, None) => {
            info!("no job queue configured, using legacy warming");
            WarmingMode::Legacy
        }
        (WarmingMode::Auto, Some(queue)) => {
            match tokio::time::timeout(config.probe_timeout, queue.ping()).await {
                Ok(Ok(())) => {
                    info!(queue = queue.name(), "job queue reachable, using integrated warming");
                    WarmingMode::Integrated
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "job queue probe failed, using legacy warming");
                    WarmingMode::Legacy
                }
                Err(_) => {
                    warn!(
                        timeout_ms = config.probe_timeout.as_millis() as u64,
                        "job queue probe timed out, using legacy warming"
                    );
                    WarmingMode::Legacy
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetrics {
    pub mode: WarmingMode,
    pub system_type: &'static str,
    pub engine: EngineStats,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub mode: WarmingMode,
    pub requested_mode: WarmingMode,
    pub integrated: bool,
    pub running: bool,
    pub system_type: &'static str,
    pub capabilities: Vec<&'static str>,
    pub queue_backend: Option<&'static str>,
    pub workers: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub mode: WarmingMode,
    pub running: bool,
    pub timestamp: DateTime<Utc>,
    pub cache_error: Option<String>,
    /// Queue backend liveness in `Integrated` mode, warm gate in `Legacy`.
    pub engine_error: Option<String>,
    pub queue_sizes: Option<QueueSizes>,
}

pub struct UnifiedCacheManager {
    cache: Arc<dyn Cache>,
    engine: ActiveEngine,
    requested_mode: WarmingMode,
    created_at: DateTime<Utc>,
}

impl UnifiedCacheManager {
    /// Pick the warming mode and build its engine.
    pub async fn new(cache: Arc<dyn Cache>, config: CacheWarmingConfig) -> Self {
        let mode = detect_mode(&config).await;
        let engine = match (mode, config.job_queue) {
            (WarmingMode::Integrated, Some(queue)) => ActiveEngine::Integrated(
                DistributedJobRouter::new(cache.clone(), queue, config.queue_breaker, config.router)
                    .with_strategy(&config.strategy),
            ),
            _ => ActiveEngine::Legacy(CacheWarmer::new(cache.clone(), config.strategy)),
        };
        info!(requested = %config.mode, active = %engine.mode(), "Cache manager initialized");

        Self {
            cache,
            engine,
            requested_mode: config.mode,
            created_at: Utc::now(),
        }
    }

    pub fn mode(&self) -> WarmingMode {
        self.engine.mode()
    }

    pub fn requested_mode(&self) -> WarmingMode {
        self.requested_mode
    }

    pub fn is_integrated(&self) -> bool {
        matches!(self.engine, ActiveEngine::Integrated(_))
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn engine(&self) -> &ActiveEngine {
        &self.engine
    }

    fn active(&self) -> &dyn WarmupEngine {
        self.engine.as_engine()
    }

    pub fn is_running(&self) -> bool {
        self.active().is_running()
    }

    pub async fn start(&self) {
        info!(mode = %self.mode(), "Starting cache warming");
        self.active().start().await;
    }

    pub async fn stop(&self) {
        self.active().stop().await;
        info!(mode = %self.mode(), "Cache warming stopped");
    }

    /// Trigger a full warm pass.
    pub async fn warmup_cache(&self) -> CacheResult<usize> {
        self.active().warmup_cache().await
    }

    pub async fn enqueue_warmup_job(
        &self,
        key: &str,
        data: Value,
        ttl: Duration,
        priority: i32,
    ) -> CacheResult<()> {
        self.active()
            .enqueue_warmup(WarmupJob::new(key, data, ttl, priority))
            .await
    }

    /// Enqueue the same value under every key with [`BATCH_WARMUP_TTL`].
    /// Stops at the first failure.
    pub async fn enqueue_batch_warmup_job(
        &self,
        keys: &[String],
        data: Value,
        priority: i32,
    ) -> CacheResult<usize> {
        for key in keys {
            self.enqueue_warmup_job(key, data.clone(), BATCH_WARMUP_TTL, priority)
                .await?;
        }
        Ok(keys.len())
    }

    pub async fn enqueue_scheduled_warmup(
        &self,
        key: &str,
        data: Value,
        ttl: Duration,
        process_at: DateTime<Utc>,
        priority: i32,
    ) -> CacheResult<()> {
        self.active()
            .enqueue_scheduled_warmup(WarmupJob::new(key, data, ttl, priority), process_at)
            .await
    }

    /// `JobUnsupported` in legacy mode.
    pub async fn enqueue_eviction_job(&self, key_or_pattern: &str, priority: i32) -> CacheResult<()> {
        self.active().enqueue_eviction(key_or_pattern, priority).await
    }

    /// `JobUnsupported` in legacy mode.
    pub async fn enqueue_validation_job(
        &self,
        key: &str,
        expected: Value,
        priority: i32,
    ) -> CacheResult<()> {
        self.active().enqueue_validation(key, expected, priority).await
    }

    pub async fn warmup_user_data(&self, user_id: &str, data: Value, ttl: Duration) -> CacheResult<()> {
        self.enqueue_warmup_job(&format!("user:{user_id}"), data, ttl, USER_DATA_PRIORITY)
            .await
    }

    /// Warm every user in `user_ids` that has an entry in `data`.
    pub async fn warmup_batch_user_data(
        &self,
        user_ids: &[String],
        mut data: HashMap<String, Value>,
        ttl: Duration,
    ) -> CacheResult<usize> {
        let mut enqueued = 0;
        for user_id in user_ids {
            if let Some(value) = data.remove(user_id) {
                self.warmup_user_data(user_id, value, ttl).await?;
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    pub async fn warmup_popular_content(
        &self,
        content_type: &str,
        items: Vec<Value>,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.enqueue_warmup_job(
            &format!("popular:{content_type}"),
            Value::Array(items),
            ttl,
            POPULAR_CONTENT_PRIORITY,
        )
        .await
    }

    /// Schedule a warmup `interval` from now. Integrated mode only.
    pub async fn schedule_periodic_warmup(
        &self,
        key: &str,
        data: Value,
        ttl: Duration,
        interval: Duration,
    ) -> CacheResult<()> {
        if !self.is_integrated() {
            return Err(CacheError::invalid_config(
                "periodic warmup requires integrated mode",
            ));
        }
        let delay = chrono::Duration::from_std(interval)
            .map_err(|e| CacheError::invalid_config(format!("invalid interval: {e}")))?;
        self.enqueue_scheduled_warmup(key, data, ttl, Utc::now() + delay, PERIODIC_WARMUP_PRIORITY)
            .await
    }

    pub async fn get_queue_sizes(&self) -> CacheResult<QueueSizes> {
        self.active().queue_sizes().await
    }

    /// Deferred jobs, earliest first.
    pub async fn list_scheduled_jobs(&self) -> CacheResult<Vec<PendingJob>> {
        self.active().pending_jobs().await
    }

    /// Most recent dead letters. Always empty in legacy mode.
    pub async fn dead_letters(&self, limit: usize) -> CacheResult<Vec<DeadLetterEntry>> {
        self.active().dead_letters(limit).await
    }

    fn system_type(&self) -> &'static str {
        if self.is_integrated() {
            "integrated"
        } else {
            "legacy_memory"
        }
    }

    pub async fn get_metrics(&self) -> ManagerMetrics {
        ManagerMetrics {
            mode: self.mode(),
            system_type: self.system_type(),
            engine: self.active().stats(),
            cache: self.cache.stats().await,
        }
    }

    pub fn get_system_info(&self) -> SystemInfo {
        let (capabilities, queue_backend, workers) = match &self.engine {
            ActiveEngine::Integrated(router) => (
                vec![
                    "distributed_processing",
                    "job_persistence",
                    "retry_logic",
                    "scheduled_jobs",
                    "dead_letter_queues",
                    "local_fallback",
                    "eviction_jobs",
                    "validation_jobs",
                ],
                Some(router.queue().name()),
                router.settings().workers,
            ),
            ActiveEngine::Legacy(warmer) => {
                let stats = warmer.get_stats();
                let mut capabilities = vec!["local_processing"];
                if stats.use_worker_pool {
                    capabilities.push("worker_pool");
                }
                if stats.use_scheduler {
                    capabilities.push("job_scheduler");
                }
                (capabilities, None, stats.concurrent_jobs)
            }
        };

        SystemInfo {
            mode: self.mode(),
            requested_mode: self.requested_mode,
            integrated: self.is_integrated(),
            running: self.is_running(),
            system_type: self.system_type(),
            capabilities,
            queue_backend,
            workers,
            created_at: self.created_at,
        }
    }

    /// Cache and engine health. Any failing component degrades the report.
    pub async fn health_check(&self) -> HealthReport {
        let cache_error = self.cache.health().await.err().map(|e| e.to_string());
        let engine_error = self.active().health().await.err().map(|e| e.to_string());
        let queue_sizes = self.get_queue_sizes().await.ok();
        let status = if cache_error.is_none() && engine_error.is_none() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            mode: self.mode(),
            running: self.is_running(),
            timestamp: Utc::now(),
            cache_error,
            engine_error,
            queue_sizes,
        }
    }

    /// Swap the warming strategy. A running engine is stopped first and
    /// restarted afterwards; a stopped one stays stopped.
    pub async fn update_configuration(&self, strategy: WarmupStrategy) -> CacheResult<()> {
        let was_running = self.is_running();
        if was_running {
            self.active().stop().await;
        }
        let result = self.active().reconfigure(strategy);
        if was_running {
            self.active().start().await;
        }
        if result.is_ok() {
            info!(mode = %self.mode(), restarted = was_running, "warming configuration updated");
        }
        result
    }

    pub async fn get<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.cache.get_value(key).await
    }

    pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.cache.set_value(key, value, ttl).await
    }

    /// Remove one key, or every key matching a `*` glob. Returns keys removed
    /// by a pattern, or 0 for a single key.
    pub async fn evict(&self, key_or_pattern: &str) -> CacheResult<u64> {
        if key_or_pattern.contains('*') {
            self.cache.delete_pattern(key_or_pattern).await
        } else {
            self.cache.delete(key_or_pattern).await.map(|()| 0)
        }
    }

    /// Drop every cached entry. Queued jobs are left alone.
    pub async fn clear_all(&self) -> CacheResult<u64> {
        let removed = self.cache.delete_pattern("*").await?;
        info!(removed, "cache cleared");
        Ok(removed)
    }
}
