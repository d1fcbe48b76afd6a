use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::CacheResult;
use crate::pattern::GlobPattern;

/// Shared (L2) tier behind the local cache.
///
/// Implementations own their own timeouts; the circuit breaker in
/// [`crate::TwoTierCache`] sees every `Err` as a backend failure.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Short backend name used in logs and stats ("redis", "memory").
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete every key matching `pattern`, returning the number deleted.
    async fn delete_pattern(&self, pattern: &GlobPattern) -> CacheResult<u64>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Liveness probe.
    async fn ping(&self) -> CacheResult<()>;

    async fn stats(&self) -> CacheResult<RemoteStats>;

    /// Release connections. Further calls fail with `Unavailable`.
    async fn close(&self);
}

/// Backend-reported statistics for the remote tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteStats {
    pub backend: String,
    /// Number of keys, when the backend can report it cheaply.
    pub keys: Option<u64>,
    pub used_memory_bytes: Option<u64>,
    pub pool_size: Option<usize>,
    pub pool_available: Option<usize>,
}
