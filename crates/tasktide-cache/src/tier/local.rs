//! In-process L1 tier.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pattern::GlobPattern;

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so hits hand out a cheap clone instead of
/// copying the serialized value.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    pub fn new(data: Arc<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            data,
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Concurrent map of cached entries. No operation here can fail.
#[derive(Debug, Default)]
pub struct LocalTier {
    map: DashMap<String, CachedEntry>,
}

impl LocalTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry, dropping it if it has expired.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        match self.map.get(key) {
            Some(entry) if !entry.is_expired() => return Some(Arc::clone(&entry.data)),
            Some(_) => {}
            None => return None,
        }
        // Only remove if still expired; a concurrent insert may have replaced it.
        self.map.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    pub fn insert(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration) {
        self.map.insert(key.to_string(), CachedEntry::new(data, ttl));
    }

    pub fn remove(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    /// Remove every key matching `pattern`, returning how many were removed.
    pub fn remove_matching(&self, pattern: &GlobPattern) -> usize {
        let before = self.map.len();
        self.map.retain(|key, _| !pattern.matches(key));
        before.saturating_sub(self.map.len())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.get(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop all expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.map.len())
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}
