//! Redis-backed remote tier.

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::remote::{RemoteStats, RemoteTier};
use crate::config::RedisConfig;
use crate::error::{CacheError, CacheResult};
use crate::pattern::GlobPattern;

const SCAN_BATCH: usize = 200;

/// Remote tier on a `deadpool-redis` pool.
///
/// Keys are stored under `key_prefix`, so pattern deletes never touch data
/// outside the cache namespace. Every command runs under a timeout:
/// `operation_timeout` for single-key commands, `pattern_timeout` for a full
/// SCAN + DEL pass, `ping_timeout` for liveness probes.
pub struct RedisTier {
    pool: Pool,
    key_prefix: String,
    operation_timeout: Duration,
    pattern_timeout: Duration,
    ping_timeout: Duration,
    closed: AtomicBool,
}

impl RedisTier {
    pub fn new(pool: Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            operation_timeout: config.operation_timeout(),
            pattern_timeout: config.pattern_timeout(),
            ping_timeout: config.ping_timeout(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T, F>(&self, op: &'static str, limit: Duration, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::unavailable("redis tier is closed"));
        }
        with_timeout(op, limit, fut).await
    }
}

/// Run one Redis round trip under `limit`, mapping expiry to `Unavailable`.
pub(crate) async fn with_timeout<T, F>(op: &'static str, limit: Duration, fut: F) -> CacheResult<T>
where
    F: Future<Output = CacheResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => {
            if let Err(e) = &result {
                tracing::warn!(op, error = %e, "Redis command failed");
            }
            result
        }
        Err(_) => {
            tracing::warn!(op, timeout_ms = limit.as_millis() as u64, "Redis command timed out");
            Err(CacheError::unavailable(format!(
                "redis {op} timed out after {}ms",
                limit.as_millis()
            )))
        }
    }
}

#[async_trait]
impl RemoteTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.bounded("GET", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            Ok(conn.get::<_, Option<Vec<u8>>>(self.namespaced(key)).await?)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        // PX 0 is rejected by Redis; the shortest expiry it accepts is 1ms.
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        self.bounded("SET", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            conn.pset_ex::<_, _, ()>(self.namespaced(key), value, ttl_ms)
                .await?;
            tracing::debug!(key = %key, ttl_ms, "cache set (L2)");
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.bounded("DEL", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            conn.del::<_, ()>(self.namespaced(key)).await?;
            Ok(())
        })
        .await
    }

    async fn delete_pattern(&self, pattern: &GlobPattern) -> CacheResult<u64> {
        let redis_pattern = format!(
            "{}{}",
            GlobPattern::new(self.key_prefix.as_str()).to_redis_pattern(),
            pattern.to_redis_pattern()
        );
        self.bounded("SCAN+DEL", self.pattern_timeout, async {
            let mut conn = self.pool.get().await?;
            let mut cursor: u64 = 0;
            let mut deleted: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&redis_pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                if !keys.is_empty() {
                    deleted += conn.del::<_, u64>(&keys).await?;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            tracing::debug!(pattern = %pattern, deleted, "cache pattern invalidated (L2)");
            Ok(deleted)
        })
        .await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.bounded("EXISTS", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            Ok(conn.exists::<_, bool>(self.namespaced(key)).await?)
        })
        .await
    }

    async fn ping(&self) -> CacheResult<()> {
        self.bounded("PING", self.ping_timeout, async {
            let mut conn = self.pool.get().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn stats(&self) -> CacheResult<RemoteStats> {
        let status = self.pool.status();
        self.bounded("INFO", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            // DBSIZE counts every key in the database, job queues included.
            let keys: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
            let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
            Ok(RemoteStats {
                backend: "redis".to_string(),
                keys: Some(keys),
                used_memory_bytes: parse_info_field(&info, "used_memory"),
                pool_size: Some(status.max_size),
                pool_available: Some(status.available),
            })
        })
        .await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pool.close();
            tracing::info!("Redis tier closed");
        }
    }
}

fn parse_info_field(info: &str, field: &str) -> Option<u64> {
    info.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name == field).then(|| value.trim().parse().ok()).flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_field() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n";
        assert_eq!(parse_info_field(info, "used_memory"), Some(1_048_576));
        assert_eq!(parse_info_field(info, "used_memory_peak"), None);
    }
}
