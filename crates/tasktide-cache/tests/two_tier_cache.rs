//! Two-tier cache behaviour against an in-process remote tier.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tasktide_cache::config::LocalCacheConfig;
use tasktide_cache::{
    Cache, CacheExt, CacheSettings, CircuitBreakerConfig, CircuitState, Codec, MemoryRemoteTier,
    TwoTierCache, create_cache_backend,
};

fn two_tier(remote: Arc<MemoryRemoteTier>, breaker: CircuitBreakerConfig) -> TwoTierCache {
    TwoTierCache::with_remote(remote, breaker, &LocalCacheConfig::default())
}

#[tokio::test]
async fn test_set_then_get_round_trips_through_both_tiers() {
    let remote = Arc::new(MemoryRemoteTier::new());
    let cache = two_tier(remote.clone(), CircuitBreakerConfig::default());

    cache
        .set_value("k1", &json!({"v": 1}), Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(remote.len(), 1);

    let value: Option<Value> = cache.get_value("k1").await.unwrap();
    assert_eq!(value, Some(json!({"v": 1})));

    let stats = cache.stats().await;
    assert_eq!(stats.mode, "two_tier");
    assert_eq!(stats.local_entries, 1);
    assert_eq!(stats.metrics.hits, 1);
}

#[tokio::test]
async fn test_remote_hit_backfills_local_tier() {
    let remote = Arc::new(MemoryRemoteTier::new());
    let writer = two_tier(remote.clone(), CircuitBreakerConfig::default());
    let reader = two_tier(remote.clone(), CircuitBreakerConfig::default());

    writer
        .set_value("shared", &json!("value"), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(!reader.local_tier().contains("shared"));

    let value: Option<String> = reader.get_value("shared").await.unwrap();
    assert_eq!(value.as_deref(), Some("value"));
    assert!(reader.local_tier().contains("shared"));

    // Served from L1 even once the remote tier goes away.
    remote.set_online(false);
    let value: Option<String> = reader.get_value("shared").await.unwrap();
    assert_eq!(value.as_deref(), Some("value"));
}

#[tokio::test]
async fn test_miss_is_not_an_error() {
    let cache = two_tier(Arc::new(MemoryRemoteTier::new()), CircuitBreakerConfig::default());
    let value: Option<Value> = cache.get_value("absent").await.unwrap();
    assert!(value.is_none());

    let err = cache.require_value::<Value>("absent").await.unwrap_err();
    assert!(err.is_miss());
}

#[tokio::test]
async fn test_delete_pattern_spans_both_tiers() {
    let remote = Arc::new(MemoryRemoteTier::new());
    let cache = two_tier(remote.clone(), CircuitBreakerConfig::default());
    for key in ["user_tasks:1", "user_tasks:2", "other:1"] {
        cache
            .set_value(key, &json!(key), Duration::from_secs(60))
            .await
            .unwrap();
    }

    assert_eq!(cache.delete_pattern("user_tasks:*").await.unwrap(), 2);

    assert!(!cache.exists("user_tasks:1").await.unwrap());
    assert!(!cache.exists("user_tasks:2").await.unwrap());
    assert!(cache.exists("other:1").await.unwrap());
    assert!(!cache.local_tier().contains("user_tasks:1"));
    assert_eq!(remote.len(), 1);
}

#[tokio::test]
async fn test_remote_failure_keeps_local_write() {
    let remote = Arc::new(MemoryRemoteTier::new());
    remote.set_online(false);
    let cache = two_tier(remote, CircuitBreakerConfig::default());

    let err = cache
        .set_value("k", &json!(1), Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(cache.local_tier().contains("k"));
    assert!(cache.health().await.is_err());
}

#[tokio::test]
async fn test_breaker_opens_and_readmits_after_timeout() {
    let remote = Arc::new(MemoryRemoteTier::new());
    remote.set_online(false);
    let cache = two_tier(
        remote.clone(),
        CircuitBreakerConfig {
            max_failures: 1,
            timeout_ms: 50,
            half_open_max_calls: 1,
        },
    );

    // One failure opens the breaker.
    assert!(cache.get("k").await.unwrap_err().is_retryable());
    assert_eq!(cache.breaker().state(), CircuitState::Open);

    // The next call is rejected without reaching the remote tier.
    assert!(cache.get("k").await.unwrap_err().is_breaker_open());

    tokio::time::sleep(Duration::from_millis(60)).await;
    remote.set_online(true);
    assert_eq!(cache.get("k").await.unwrap(), None);
    assert_eq!(cache.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_msgpack_codec() {
    let config = LocalCacheConfig {
        codec: Codec::MessagePack,
        ..LocalCacheConfig::default()
    };
    let cache = TwoTierCache::new_local(&config);
    assert_eq!(cache.codec(), Codec::MessagePack);

    cache
        .set_value("k", &vec![1u32, 2, 3], Duration::from_secs(60))
        .await
        .unwrap();
    let value: Option<Vec<u32>> = cache.get_value("k").await.unwrap();
    assert_eq!(value, Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_local_entries_expire() {
    let cache = TwoTierCache::new_local(&LocalCacheConfig::default());
    cache
        .set_value("short", &json!(1), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(cache.exists("short").await.unwrap());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!cache.exists("short").await.unwrap());
}

#[tokio::test]
async fn test_sweeper_purges_expired_entries() {
    let cache = Arc::new(TwoTierCache::new_local(&LocalCacheConfig::default()));
    cache
        .set_value("short", &json!(1), Duration::from_millis(10))
        .await
        .unwrap();
    cache
        .set_value("long", &json!(1), Duration::from_secs(60))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = cache.spawn_sweeper(Duration::from_millis(20), shutdown_rx);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.local_tier().len(), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_factory_cache_sweeps_expired_entries_until_closed() {
    let mut settings = CacheSettings::default();
    settings.local_cache.sweep_interval_secs = 1;
    let cache = create_cache_backend(&settings).await;
    assert!(cache.is_sweeping());

    cache
        .set_value("k", &json!(1), Duration::from_millis(10))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.local_tier().len(), 0);

    cache.close().await;
    assert!(!cache.is_sweeping());
}

#[tokio::test]
async fn test_zero_sweep_interval_disables_sweeper() {
    let mut settings = CacheSettings::default();
    settings.local_cache.sweep_interval_secs = 0;
    let cache = create_cache_backend(&settings).await;
    assert!(!cache.is_sweeping());
    assert!(cache.start_sweeper(Duration::from_millis(20)));
    assert!(!cache.start_sweeper(Duration::from_millis(20)));
    cache.close().await;
}
