//! Persisted job model for the distributed router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// TTL applied when a warmup payload carries none.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);

/// Kinds of work the router can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Warmup,
    Eviction,
    Validation,
}

impl JobType {
    /// Every job type, in polling order.
    pub const ALL: [JobType; 3] = [JobType::Warmup, JobType::Eviction, JobType::Validation];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Warmup => "warmup",
            JobType::Eviction => "eviction",
            JobType::Validation => "validation",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work stored in a [`JobQueue`](super::JobQueue).
///
/// The payload is a free-form map: `key` for every type, plus `data` and
/// `ttl_ms` for warmups and `expected` for validations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedJob {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: Map<String, Value>,
    pub max_tries: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub process_at: DateTime<Utc>,
    pub priority: i32,
}

impl DistributedJob {
    fn new(job_type: JobType, payload: Map<String, Value>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}-{}", job_type, Uuid::new_v4()),
            job_type,
            payload,
            max_tries: 3,
            attempts: 0,
            created_at: now,
            process_at: now,
            priority,
        }
    }

    pub fn warmup(key: impl Into<String>, data: Value, ttl: Duration, priority: i32) -> Self {
        let mut payload = Map::new();
        payload.insert("key".into(), Value::String(key.into()));
        payload.insert("data".into(), data);
        payload.insert("ttl_ms".into(), Value::from(ttl.as_millis() as u64));
        Self::new(JobType::Warmup, payload, priority)
    }

    /// `key_or_pattern` containing `*` evicts every matching key.
    pub fn eviction(key_or_pattern: impl Into<String>, priority: i32) -> Self {
        let mut payload = Map::new();
        payload.insert("key".into(), Value::String(key_or_pattern.into()));
        Self::new(JobType::Eviction, payload, priority)
    }

    pub fn validation(key: impl Into<String>, expected: Value, priority: i32) -> Self {
        let mut payload = Map::new();
        payload.insert("key".into(), Value::String(key.into()));
        payload.insert("expected".into(), expected);
        Self::new(JobType::Validation, payload, priority)
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    pub fn scheduled_at(mut self, process_at: DateTime<Utc>) -> Self {
        self.process_at = process_at;
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.payload.get("key").and_then(Value::as_str)
    }

    pub fn data(&self) -> &Value {
        self.payload.get("data").unwrap_or(&Value::Null)
    }

    pub fn expected(&self) -> &Value {
        self.payload.get("expected").unwrap_or(&Value::Null)
    }

    /// Warmup TTL. Payloads written with whole seconds (`ttl_secs`) still read.
    pub fn ttl(&self) -> Duration {
        let field = |name: &str| self.payload.get(name).and_then(Value::as_u64);
        field("ttl_ms")
            .map(Duration::from_millis)
            .or_else(|| field("ttl_secs").map(Duration::from_secs))
            .unwrap_or(DEFAULT_JOB_TTL)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.process_at <= now
    }

    /// Count a failed attempt. Returns `false` once `max_tries` is reached;
    /// otherwise pushes `process_at` out by `base * 2^attempts`.
    pub fn schedule_retry(&mut self, base: Duration) -> bool {
        self.attempts += 1;
        if self.exhausted() {
            return false;
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = base.saturating_mul(factor);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.process_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        true
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_tries
    }
}

/// A job that ran out of attempts or failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_job: DistributedJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(original_job: DistributedJob, error: impl Into<String>) -> Self {
        Self {
            original_job,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }

    /// A queue member that no longer decodes, kept verbatim under `payload.raw`.
    pub fn undecodable(
        job_type: JobType,
        raw: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("raw".into(), Value::String(raw.into()));
        Self::new(
            DistributedJob::new(job_type, payload, 0),
            format!("undecodable job: {error}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_warmup_payload() {
        let job = DistributedJob::warmup("k1", json!({"v": 1}), Duration::from_secs(120), 5);
        assert!(job.id.starts_with("warmup-"));
        assert_eq!(job.key(), Some("k1"));
        assert_eq!(job.data(), &json!({"v": 1}));
        assert_eq!(job.ttl(), Duration::from_secs(120));
        assert_eq!(job.max_tries, 3);
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn test_sub_second_ttl_survives_serialization() {
        let job = DistributedJob::warmup("k", json!(1), Duration::from_millis(250), 0);
        let bytes = serde_json::to_vec(&job).unwrap();
        let back: DistributedJob = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.ttl(), Duration::from_millis(250));

        let mut legacy = back.clone();
        legacy.payload.remove("ttl_ms");
        legacy.payload.insert("ttl_secs".into(), json!(30));
        assert_eq!(legacy.ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_undecodable_member_keeps_raw_payload() {
        let err = serde_json::from_str::<DistributedJob>("{not json").unwrap_err();
        let entry = DeadLetterEntry::undecodable(JobType::Eviction, "{not json", err);
        assert_eq!(entry.original_job.job_type, JobType::Eviction);
        assert_eq!(entry.original_job.payload["raw"], json!("{not json"));
        assert_eq!(entry.original_job.key(), None);
        assert!(entry.error.starts_with("undecodable job:"));
    }

    #[test]
    fn test_serialized_type_field() {
        let job = DistributedJob::eviction("user:*", 1);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "eviction");
        let back: DistributedJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.ttl(), DEFAULT_JOB_TTL);
    }

    #[test]
    fn test_retry_backoff_then_exhaustion() {
        let mut job = DistributedJob::validation("k", json!(1), 0);
        let before = Utc::now();

        assert!(job.schedule_retry(Duration::from_secs(60)));
        assert_eq!(job.attempts, 1);
        let delay = job.process_at - before;
        assert!(delay >= chrono::Duration::seconds(120));
        assert!(delay < chrono::Duration::seconds(125));

        assert!(job.schedule_retry(Duration::from_secs(60)));
        assert!(job.process_at - before >= chrono::Duration::seconds(240));

        assert!(!job.schedule_retry(Duration::from_secs(60)));
        assert!(job.exhausted());
    }

    #[test]
    fn test_scheduled_job_not_due() {
        let later = Utc::now() + chrono::Duration::minutes(5);
        let job = DistributedJob::eviction("k", 0).scheduled_at(later);
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(later));
    }
}
