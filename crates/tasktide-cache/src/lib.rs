//! Resilient two-tier cache with job-driven warming.
//!
//! Reads and writes go through a [`TwoTierCache`]: an in-process map in front
//! of an optional shared remote tier guarded by a circuit breaker. Warming is
//! driven by a [`UnifiedCacheManager`], which runs either the local
//! [`CacheWarmer`] or the [`DistributedJobRouter`] over persisted job queues.
//!
//! ## Cache Modes
//!
//! - **Redis disabled**: local tier only
//! - **Redis enabled**: local tier in front of Redis; if Redis cannot be
//!   reached at startup the cache degrades to local only

pub mod backend;
pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod observability;
pub mod pattern;
pub mod priority_queue;
pub mod scheduler;
pub mod tier;
pub mod warmer;
pub mod worker_pool;

use std::sync::Arc;

use deadpool_redis::Pool;

pub use backend::{Cache, CacheExt, CacheStats, TwoTierCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use codec::Codec;
pub use config::{CacheSettings, RedisConfig, WarmingConfig, WarmingMode};
pub use distributed::{
    DeadLetterEntry, DistributedJob, DistributedJobRouter, JobQueue, JobType, MemoryJobQueue,
    QueueSizes, RedisJobQueue,
};
pub use engine::{ActiveEngine, PendingJob, WarmupEngine};
pub use error::{CacheError, CacheResult};
pub use job::{HealthCheck, WarmupJob};
pub use manager::{CacheWarmingConfig, UnifiedCacheManager};
pub use observability::{init_tracing, init_tracing_with_level};
pub use priority_queue::PriorityQueue;
pub use scheduler::JobScheduler;
pub use tier::{LocalTier, MemoryRemoteTier, RedisTier, RemoteTier};
pub use warmer::{CacheWarmer, WarmupStrategy};
pub use worker_pool::WorkerPool;

/// Open a Redis pool and check that a connection can be made.
///
/// Returns `None` when Redis is disabled or unreachable; callers then run
/// without a remote tier.
pub async fn connect_redis(config: &RedisConfig) -> Option<Pool> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return None;
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = Some(config.timeout());
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts = deadpool_redis::Timeouts {
        wait: timeout,
        create: timeout,
        recycle: timeout,
    };
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return None;
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis");
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            None
        }
    }
}

fn build_cache(settings: &CacheSettings, pool: Option<Pool>) -> Arc<TwoTierCache> {
    let cache = match pool {
        Some(pool) => TwoTierCache::with_remote(
            Arc::new(RedisTier::new(pool, &settings.redis)),
            settings.circuit_breaker.clone(),
            &settings.local_cache,
        ),
        None => TwoTierCache::new_local(&settings.local_cache),
    };
    let cache = Arc::new(cache);
    if let Some(period) = settings.local_cache.sweep_interval() {
        cache.start_sweeper(period);
    }
    cache
}

/// Create a cache from configuration, degrading to local only if Redis is
/// disabled or unreachable.
pub async fn create_cache_backend(settings: &CacheSettings) -> Arc<TwoTierCache> {
    build_cache(settings, connect_redis(&settings.redis).await)
}

/// A Redis job queue on an existing pool.
pub fn create_job_queue(pool: Pool, settings: &CacheSettings) -> Arc<dyn JobQueue> {
    Arc::new(RedisJobQueue::new(pool, &settings.redis, &settings.warming))
}

/// Validate settings, connect to Redis once, and build the cache plus a
/// manager whose engine matches what is reachable.
pub async fn create_cache_manager(settings: &CacheSettings) -> CacheResult<UnifiedCacheManager> {
    settings.validate().map_err(CacheError::invalid_config)?;

    let pool = connect_redis(&settings.redis).await;
    let job_queue = pool.clone().map(|pool| create_job_queue(pool, settings));
    let cache = build_cache(settings, pool);

    let config = CacheWarmingConfig::from_settings(settings, job_queue);
    Ok(UnifiedCacheManager::new(cache, config).await)
}
