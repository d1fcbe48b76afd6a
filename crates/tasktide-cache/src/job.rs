//! Local warmup job and health predicate types.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// A cache entry to (re)populate.
///
/// `priority` is fixed once the job is queued: higher values are applied first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupJob {
    pub key: String,
    pub data: serde_json::Value,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    pub priority: i32,
}

impl WarmupJob {
    pub fn new(
        key: impl Into<String>,
        data: serde_json::Value,
        ttl: Duration,
        priority: i32,
    ) -> Self {
        Self {
            key: key.into(),
            data,
            ttl,
            priority,
        }
    }
}

/// Async predicate gating periodic work. `true` means healthy.
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// A health check that always passes.
pub fn always_healthy() -> HealthCheck {
    Arc::new(|| Box::pin(async { true }))
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ttl_serialized_as_seconds() {
        let job = WarmupJob::new("k1", json!({"v": 1}), Duration::from_secs(3600), 5);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["ttl"], 3600);
        assert_eq!(value["priority"], 5);
    }

    #[tokio::test]
    async fn test_always_healthy() {
        let check = always_healthy();
        assert!(check().await);
    }
}
