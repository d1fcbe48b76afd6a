//! Job queue abstraction and its in-process implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use super::job::{DeadLetterEntry, DistributedJob, JobType};
use crate::error::{CacheError, CacheResult};

/// Queue name under which dead letters are counted in [`QueueSizes`].
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// Depth per queue name: one entry per job type plus `dead_letter`.
pub type QueueSizes = BTreeMap<String, u64>;

/// Persistent store the distributed router pulls work from.
///
/// Claims must be exclusive: a job returned by `claim_due` to one caller is
/// never returned to another.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Backend name for logs and stats.
    fn name(&self) -> &'static str;

    async fn ping(&self) -> CacheResult<()>;

    async fn push(&self, job: &DistributedJob) -> CacheResult<()>;

    /// Remove and return up to `limit` jobs of `job_type` due at `now`.
    async fn claim_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CacheResult<Vec<DistributedJob>>;

    async fn dead_letter(&self, entry: &DeadLetterEntry) -> CacheResult<()>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> CacheResult<Vec<DeadLetterEntry>>;

    /// Jobs of every type still waiting for a future `process_at`.
    async fn scheduled(&self, now: DateTime<Utc>) -> CacheResult<Vec<DistributedJob>>;

    async fn sizes(&self) -> CacheResult<QueueSizes>;

    /// Drop all jobs and dead letters.
    async fn clear(&self) -> CacheResult<()>;
}

/// In-process [`JobQueue`]. Jobs do not survive the process.
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<JobType, Vec<DistributedJob>>>,
    dead: Mutex<VecDeque<DeadLetterEntry>>,
    dead_letter_capacity: usize,
    online: AtomicBool,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryJobQueue {
    pub fn new(dead_letter_capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            dead: Mutex::new(VecDeque::new()),
            dead_letter_capacity: dead_letter_capacity.max(1),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while offline every call fails with `Unavailable`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    fn check_online(&self) -> CacheResult<()> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::unavailable("job queue is offline"))
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check_online()
    }

    async fn push(&self, job: &DistributedJob) -> CacheResult<()> {
        self.check_online()?;
        self.jobs
            .lock()
            .entry(job.job_type)
            .or_default()
            .push(job.clone());
        Ok(())
    }

    async fn claim_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CacheResult<Vec<DistributedJob>> {
        self.check_online()?;
        let mut jobs = self.jobs.lock();
        let Some(queue) = jobs.get_mut(&job_type) else {
            return Ok(Vec::new());
        };

        // Earliest due first, same order as a sorted set scored by process_at.
        queue.sort_by_key(|job| job.process_at);
        let due = queue
            .iter()
            .take_while(|job| job.is_due(now))
            .count()
            .min(limit);
        Ok(queue.drain(..due).collect())
    }

    async fn dead_letter(&self, entry: &DeadLetterEntry) -> CacheResult<()> {
        self.check_online()?;
        let mut dead = self.dead.lock();
        dead.push_front(entry.clone());
        dead.truncate(self.dead_letter_capacity);
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> CacheResult<Vec<DeadLetterEntry>> {
        self.check_online()?;
        Ok(self.dead.lock().iter().take(limit).cloned().collect())
    }

    async fn scheduled(&self, now: DateTime<Utc>) -> CacheResult<Vec<DistributedJob>> {
        self.check_online()?;
        let mut pending: Vec<DistributedJob> = self
            .jobs
            .lock()
            .values()
            .flatten()
            .filter(|job| !job.is_due(now))
            .cloned()
            .collect();
        pending.sort_by_key(|job| job.process_at);
        Ok(pending)
    }

    async fn sizes(&self) -> CacheResult<QueueSizes> {
        self.check_online()?;
        let mut sizes: QueueSizes = {
            let jobs = self.jobs.lock();
            JobType::ALL
                .iter()
                .map(|t| {
                    let depth = jobs.get(t).map_or(0, Vec::len) as u64;
                    (t.as_str().to_string(), depth)
                })
                .collect()
        };
        sizes.insert(DEAD_LETTER_QUEUE.to_string(), self.dead.lock().len() as u64);
        Ok(sizes)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.check_online()?;
        self.jobs.lock().clear();
        self.dead.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn warmup(key: &str, priority: i32) -> DistributedJob {
        DistributedJob::warmup(key, json!(key), Duration::from_secs(60), priority)
    }

    #[tokio::test]
    async fn test_claim_due_only_returns_due_jobs() {
        let queue = MemoryJobQueue::default();
        let now = Utc::now();
        queue.push(&warmup("now", 1)).await.unwrap();
        queue
            .push(&warmup("later", 9).scheduled_at(now + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let claimed = queue
            .claim_due(JobType::Warmup, Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].key(), Some("now"));

        // Claimed jobs are gone.
        assert!(queue
            .claim_due(JobType::Warmup, Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());

        let scheduled = queue.scheduled(Utc::now()).await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].key(), Some("later"));
    }

    #[tokio::test]
    async fn test_claim_respects_limit() {
        let queue = MemoryJobQueue::default();
        for i in 0..5 {
            queue.push(&warmup(&format!("k{i}"), i)).await.unwrap();
        }
        let claimed = queue
            .claim_due(JobType::Warmup, Utc::now(), 2)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(queue.sizes().await.unwrap()["warmup"], 3);
    }

    #[tokio::test]
    async fn test_sizes_and_dead_letter_cap() {
        let queue = MemoryJobQueue::new(2);
        queue.push(&DistributedJob::eviction("a", 0)).await.unwrap();
        for i in 0..3 {
            let entry = DeadLetterEntry::new(warmup(&format!("d{i}"), 0), "boom");
            queue.dead_letter(&entry).await.unwrap();
        }

        let sizes = queue.sizes().await.unwrap();
        assert_eq!(sizes["warmup"], 0);
        assert_eq!(sizes["eviction"], 1);
        assert_eq!(sizes["validation"], 0);
        assert_eq!(sizes[DEAD_LETTER_QUEUE], 2);

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].original_job.key(), Some("d2"));
        assert_eq!(dead[1].original_job.key(), Some("d1"));

        queue.clear().await.unwrap();
        assert_eq!(queue.sizes().await.unwrap()[DEAD_LETTER_QUEUE], 0);
    }

    #[tokio::test]
    async fn test_offline_queue_fails() {
        let queue = MemoryJobQueue::default();
        queue.set_online(false);
        assert!(queue.ping().await.is_err());
        assert!(queue.push(&warmup("k", 0)).await.unwrap_err().is_retryable());
    }
}
