//! Two-tier cache: L1 (DashMap) in front of an optional shared L2.
//!
//! ## Read path
//!
//! 1. Check L1 (microsecond latency)
//! 2. Check L2 through the circuit breaker
//! 3. Backfill L1 on an L2 hit with the short backfill TTL
//!
//! ## Write path
//!
//! L1 is written unconditionally, then L2. An L2 failure is returned to the
//! caller; the L1 write stays in place.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::codec::Codec;
use crate::config::LocalCacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::metrics::{self, CacheMetrics, CacheMetricsSnapshot};
use crate::pattern::GlobPattern;
use crate::tier::{LocalTier, RemoteStats, RemoteTier};

/// The cache contract shared by every caller.
///
/// Values cross this boundary as encoded bytes; [`CacheExt`] adds typed
/// access through the cache's [`Codec`]. A miss is `Ok(None)`, never an error.
#[async_trait]
pub trait Cache: Send + Sync {
    fn codec(&self) -> Codec;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Remove every key matching a `*` glob from all tiers.
    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    async fn stats(&self) -> CacheStats;

    /// `Ok` when the shared tier is reachable. Local-only caches are always healthy.
    async fn health(&self) -> CacheResult<()>;

    async fn close(&self);
}

/// Typed helpers on top of [`Cache`].
#[async_trait]
pub trait CacheExt: Cache {
    async fn set_value<T>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = self.codec().encode(value)?;
        self.set(key, bytes, ttl).await
    }

    async fn get_value<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(self.codec().decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`CacheExt::get_value`], but a miss is [`CacheError::Miss`].
    async fn require_value<T>(&self, key: &str) -> CacheResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.get_value(key)
            .await?
            .ok_or_else(|| CacheError::miss(key))
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// "local" or "two_tier"
    pub mode: String,
    pub codec: String,
    pub local_entries: usize,
    pub metrics: CacheMetricsSnapshot,
    pub hit_rate: f64,
    pub breaker: Option<CircuitBreakerStats>,
    pub remote: Option<RemoteStats>,
}

pub struct TwoTierCache {
    local: LocalTier,
    remote: Option<Arc<dyn RemoteTier>>,
    breaker: CircuitBreaker,
    metrics: CacheMetrics,
    codec: Codec,
    backfill_ttl: Duration,
    sweeper: parking_lot::Mutex<Option<Sweeper>>,
}

/// A running expiry sweep, stopped on [`Cache::close`].
struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TwoTierCache {
    /// Create a local-only cache.
    pub fn new_local(config: &LocalCacheConfig) -> Self {
        Self {
            local: LocalTier::new(),
            remote: None,
            breaker: CircuitBreaker::new("cache", CircuitBreakerConfig::default()),
            metrics: CacheMetrics::new(),
            codec: config.codec,
            backfill_ttl: config.backfill_ttl(),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    /// Create a cache backed by a shared remote tier.
    pub fn with_remote(
        remote: Arc<dyn RemoteTier>,
        breaker: CircuitBreakerConfig,
        config: &LocalCacheConfig,
    ) -> Self {
        Self {
            local: LocalTier::new(),
            breaker: CircuitBreaker::new(format!("cache-{}", remote.name()), breaker),
            remote: Some(remote),
            metrics: CacheMetrics::new(),
            codec: config.codec,
            backfill_ttl: config.backfill_ttl(),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_local_only(&self) -> bool {
        self.remote.is_none()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// The L1 tier (for tests and internal use).
    pub fn local_tier(&self) -> &LocalTier {
        &self.local
    }

    fn remote_failed(&self, op: &'static str, key: &str, err: &CacheError) {
        self.metrics.record_error();
        metrics::record_cache_error(op);
        tracing::warn!(key = %key, op, error = %err, "remote cache tier operation failed");
    }

    /// Start the owned expiry sweep. Returns `false` if one is already running.
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) -> bool {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return false;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = self.spawn_sweeper(period, shutdown_rx);
        *sweeper = Some(Sweeper { shutdown, handle });
        tracing::debug!(period_ms = period.as_millis() as u64, "local cache sweeper started");
        true
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    async fn stop_sweeper(&self) {
        let Some(sweeper) = self.sweeper.lock().take() else {
            return;
        };
        let _ = sweeper.shutdown.send(true);
        if let Err(e) = sweeper.handle.await {
            tracing::warn!(error = %e, "local cache sweeper task failed");
        }
    }

    /// Periodically drop expired L1 entries until `shutdown` flips to `true`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let purged = cache.local.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "swept expired local cache entries");
                        }
                        metrics::set_cache_entries("L1", cache.local.len());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("local cache sweeper stopped");
        })
    }
}

#[async_trait]
impl Cache for TwoTierCache {
    fn codec(&self) -> Codec {
        self.codec
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let data = Arc::new(value);
        self.local.insert(key, Arc::clone(&data), ttl);
        self.metrics.record_set();

        let Some(remote) = &self.remote else {
            tracing::debug!(key = %key, "cache set (L1)");
            return Ok(());
        };

        match self.breaker.execute(|| remote.set(key, &data, ttl)).await {
            Ok(()) => {
                tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cache set (L1+L2)");
                Ok(())
            }
            Err(e) => {
                self.remote_failed("set", key, &e);
                Err(e)
            }
        }
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>> {
        if let Some(data) = self.local.get(key) {
            tracing::debug!(key = %key, "cache hit (L1)");
            self.metrics.record_hit();
            metrics::record_cache_hit("L1");
            return Ok(Some(data));
        }

        let Some(remote) = &self.remote else {
            self.metrics.record_miss();
            metrics::record_cache_miss();
            return Ok(None);
        };

        match self.breaker.execute(|| remote.get(key)).await {
            Ok(Some(bytes)) => {
                tracing::debug!(key = %key, "cache hit (L2)");
                self.metrics.record_hit();
                metrics::record_cache_hit("L2");

                let data = Arc::new(bytes);
                self.local.insert(key, Arc::clone(&data), self.backfill_ttl);
                Ok(Some(data))
            }
            Ok(None) => {
                tracing::debug!(key = %key, "cache miss");
                self.metrics.record_miss();
                metrics::record_cache_miss();
                Ok(None)
            }
            Err(e) => {
                self.remote_failed("get", key, &e);
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.local.remove(key);
        self.metrics.record_delete();

        let Some(remote) = &self.remote else {
            return Ok(());
        };
        self.breaker
            .execute(|| remote.delete(key))
            .await
            .inspect_err(|e| self.remote_failed("delete", key, e))
    }

    /// Returns the number of removed keys as reported by the authoritative
    /// tier (L2 when configured, otherwise L1).
    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let glob = GlobPattern::new(pattern);
        let local_removed = self.local.remove_matching(&glob) as u64;
        self.metrics.record_delete();

        let Some(remote) = &self.remote else {
            tracing::debug!(pattern = %glob, removed = local_removed, "cache pattern invalidated (L1)");
            return Ok(local_removed);
        };
        self.breaker
            .execute(|| remote.delete_pattern(&glob))
            .await
            .inspect_err(|e| self.remote_failed("delete_pattern", pattern, e))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        if self.local.contains(key) {
            return Ok(true);
        }
        let Some(remote) = &self.remote else {
            return Ok(false);
        };
        self.breaker
            .execute(|| remote.exists(key))
            .await
            .inspect_err(|e| self.remote_failed("exists", key, e))
    }

    async fn stats(&self) -> CacheStats {
        let remote = match &self.remote {
            Some(remote) => match self.breaker.execute(|| remote.stats()).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::debug!(error = %e, "remote cache stats unavailable");
                    None
                }
            },
            None => None,
        };

        let snapshot = self.metrics.snapshot();
        metrics::set_cache_entries("L1", self.local.len());
        let mode = if self.remote.is_some() { "two_tier" } else { "local" };
        CacheStats {
            mode: mode.to_string(),
            codec: self.codec.name().to_string(),
            local_entries: self.local.len(),
            hit_rate: snapshot.hit_rate,
            metrics: snapshot,
            breaker: self.remote.as_ref().map(|_| self.breaker.stats()),
            remote,
        }
    }

    async fn health(&self) -> CacheResult<()> {
        match &self.remote {
            Some(remote) => self.breaker.execute(|| remote.ping()).await,
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.stop_sweeper().await;
        if let Some(remote) = &self.remote {
            remote.close().await;
        }
        self.local.clear();
    }
}
