//! In-process remote tier.
//!
//! Shares one TTL-aware map between every cache that holds the same
//! `Arc<MemoryRemoteTier>`. Useful for single-host deployments that still want
//! the two-tier read path, and for exercising failure handling: taking the tier
//! offline makes every call fail with `Unavailable`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::local::CachedEntry;
use super::remote::{RemoteStats, RemoteTier};
use crate::error::{CacheError, CacheResult};
use crate::pattern::GlobPattern;

#[derive(Debug)]
pub struct MemoryRemoteTier {
    map: DashMap<String, CachedEntry>,
    online: AtomicBool,
}

impl Default for MemoryRemoteTier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteTier {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Toggle availability. While offline every call fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> CacheResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(CacheError::unavailable("memory remote tier is offline"))
        }
    }
}

#[async_trait]
impl RemoteTier for MemoryRemoteTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check_online()?;
        let found = self
            .map
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.data.as_ref().clone());
        if found.is_none() {
            self.map.remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.check_online()?;
        self.map
            .insert(key.to_string(), CachedEntry::new(Arc::new(value.to_vec()), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.check_online()?;
        self.map.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &GlobPattern) -> CacheResult<u64> {
        self.check_online()?;
        let before = self.map.len();
        self.map.retain(|key, _| !pattern.matches(key));
        Ok(before.saturating_sub(self.map.len()) as u64)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check_online()?;
        Ok(self.map.get(key).is_some_and(|entry| !entry.is_expired()))
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check_online()
    }

    async fn stats(&self) -> CacheResult<RemoteStats> {
        self.check_online()?;
        Ok(RemoteStats {
            backend: "memory".to_string(),
            keys: Some(self.len() as u64),
            ..RemoteStats::default()
        })
    }

    async fn close(&self) {
        self.set_online(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_expiry() {
        let tier = MemoryRemoteTier::new();
        tier.set("a", b"1", Duration::from_millis(20)).await.unwrap();
        assert!(tier.exists("a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tier.get("a").await.unwrap(), None);
        assert!(!tier.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let tier = MemoryRemoteTier::new();
        tier.set_online(false);
        assert!(tier.ping().await.is_err());
        assert!(matches!(
            tier.get("a").await,
            Err(CacheError::Unavailable { .. })
        ));
        tier.set_online(true);
        assert!(tier.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_pattern_literal_question_mark() {
        let tier = MemoryRemoteTier::new();
        let ttl = Duration::from_secs(60);
        tier.set("q?1", b"x", ttl).await.unwrap();
        tier.set("qa1", b"y", ttl).await.unwrap();
        let deleted = tier.delete_pattern(&GlobPattern::new("q?*")).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(tier.exists("qa1").await.unwrap());
    }
}
