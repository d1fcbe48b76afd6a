//! Redis-backed job queue.
//!
//! Layout under `queue_prefix`:
//! - `{prefix}:{type}`: sorted set of JSON-encoded jobs scored by `process_at`
//!   in milliseconds.
//! - `{prefix}:dead`: list of dead letters, newest first, capped with `LTRIM`.
//!
//! A claim reads due members with `ZRANGEBYSCORE` and keeps only those its
//! own `ZREM` removed, so concurrent workers never run the same job twice.
//! A claimed member that no longer decodes goes to the dead-letter list as is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;

use super::job::{DeadLetterEntry, DistributedJob, JobType};
use super::queue::{DEAD_LETTER_QUEUE, JobQueue, QueueSizes};
use crate::config::{RedisConfig, WarmingConfig};
use crate::error::CacheResult;
use crate::tier::with_timeout;

pub struct RedisJobQueue {
    pool: Pool,
    prefix: String,
    dead_letter_capacity: usize,
    operation_timeout: Duration,
    ping_timeout: Duration,
}

impl RedisJobQueue {
    pub fn new(pool: Pool, redis: &RedisConfig, warming: &WarmingConfig) -> Self {
        Self {
            pool,
            prefix: warming.queue_prefix.trim_end_matches(':').to_string(),
            dead_letter_capacity: warming.dead_letter_capacity.max(1),
            operation_timeout: redis.operation_timeout(),
            ping_timeout: redis.ping_timeout(),
        }
    }

    fn queue_key(&self, job_type: JobType) -> String {
        format!("{}:{}", self.prefix, job_type)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    async fn pending(&self, min: String) -> CacheResult<Vec<DistributedJob>> {
        with_timeout("ZRANGEBYSCORE", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            let mut jobs = Vec::new();
            for job_type in JobType::ALL {
                let members: Vec<String> = conn
                    .zrangebyscore(self.queue_key(job_type), &min, "+inf")
                    .await?;
                jobs.extend(members.iter().filter_map(|m| decode_job(m)));
            }
            jobs.sort_by_key(|job| job.process_at);
            Ok(jobs)
        })
        .await
    }
}

fn decode_job(member: &str) -> Option<DistributedJob> {
    match serde_json::from_str(member) {
        Ok(job) => Some(job),
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable job");
            None
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> CacheResult<()> {
        with_timeout("PING", self.ping_timeout, async {
            let mut conn = self.pool.get().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn push(&self, job: &DistributedJob) -> CacheResult<()> {
        let member = serde_json::to_string(job)?;
        let score = job.process_at.timestamp_millis();
        with_timeout("ZADD", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            let _: () = conn.zadd(self.queue_key(job.job_type), member, score).await?;
            tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
            Ok(())
        })
        .await
    }

    async fn claim_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CacheResult<Vec<DistributedJob>> {
        let key = self.queue_key(job_type);
        let dead_key = self.dead_key();
        let stop = self.dead_letter_capacity as isize - 1;
        let max = now.timestamp_millis();
        with_timeout("ZRANGEBYSCORE+ZREM", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            let members: Vec<String> = conn
                .zrangebyscore_limit(&key, "-inf", max, 0, limit as isize)
                .await?;

            let mut claimed = Vec::with_capacity(members.len());
            for member in members {
                let removed: i64 = conn.zrem(&key, &member).await?;
                if removed == 0 {
                    // Another worker got there first.
                    continue;
                }
                match serde_json::from_str::<DistributedJob>(&member) {
                    Ok(job) => claimed.push(job),
                    Err(e) => {
                        tracing::warn!(job_type = %job_type, error = %e, "undecodable job moved to dead-letter queue");
                        let entry = DeadLetterEntry::undecodable(job_type, member, e);
                        let _: () = conn.lpush(&dead_key, serde_json::to_string(&entry)?).await?;
                        let _: () = conn.ltrim(&dead_key, 0, stop).await?;
                    }
                }
            }
            Ok(claimed)
        })
        .await
    }

    async fn dead_letter(&self, entry: &DeadLetterEntry) -> CacheResult<()> {
        let encoded = serde_json::to_string(entry)?;
        let key = self.dead_key();
        let stop = self.dead_letter_capacity as isize - 1;
        with_timeout("LPUSH+LTRIM", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            let _: () = conn.lpush(&key, encoded).await?;
            let _: () = conn.ltrim(&key, 0, stop).await?;
            Ok(())
        })
        .await
    }

    async fn dead_letters(&self, limit: usize) -> CacheResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        with_timeout("LRANGE", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            let raw: Vec<String> = conn
                .lrange(self.dead_key(), 0, limit as isize - 1)
                .await?;
            Ok(raw
                .iter()
                .filter_map(|r| serde_json::from_str(r).ok())
                .collect())
        })
        .await
    }

    async fn scheduled(&self, now: DateTime<Utc>) -> CacheResult<Vec<DistributedJob>> {
        // Exclusive lower bound: jobs due exactly at `now` are not pending.
        self.pending(format!("({}", now.timestamp_millis())).await
    }

    async fn sizes(&self) -> CacheResult<QueueSizes> {
        with_timeout("ZCARD", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            let mut sizes = QueueSizes::new();
            for job_type in JobType::ALL {
                let depth: u64 = conn.zcard(self.queue_key(job_type)).await?;
                sizes.insert(job_type.as_str().to_string(), depth);
            }
            let dead: u64 = conn.llen(self.dead_key()).await?;
            sizes.insert(DEAD_LETTER_QUEUE.to_string(), dead);
            Ok(sizes)
        })
        .await
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut keys: Vec<String> = JobType::ALL.iter().map(|t| self.queue_key(*t)).collect();
        keys.push(self.dead_key());
        with_timeout("DEL", self.operation_timeout, async {
            let mut conn = self.pool.get().await?;
            let _: () = conn.del(&keys).await?;
            tracing::info!(prefix = %self.prefix, "job queues cleared");
            Ok(())
        })
        .await
    }
}
