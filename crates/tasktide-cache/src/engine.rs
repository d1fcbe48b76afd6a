//! Common surface of the two warming engines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::WarmingMode;
use crate::distributed::{
    DeadLetterEntry, DistributedJob, DistributedJobRouter, JobType, QueueSizes, RouterMetrics,
};
use crate::error::{CacheError, CacheResult};
use crate::job::WarmupJob;
use crate::scheduler::ScheduledJob;
use crate::warmer::{CacheWarmer, WarmerStats, WarmupStrategy};

/// Queue name reported by the local engine in [`QueueSizes`].
pub const LOCAL_QUEUE: &str = "local";

/// A job waiting for its `process_at`, in either engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingJob {
    /// Set for distributed jobs only.
    pub id: Option<String>,
    pub job_type: JobType,
    pub key: String,
    pub priority: i32,
    pub process_at: DateTime<Utc>,
}

impl From<ScheduledJob> for PendingJob {
    fn from(scheduled: ScheduledJob) -> Self {
        Self {
            id: None,
            job_type: JobType::Warmup,
            key: scheduled.job.key,
            priority: scheduled.job.priority,
            process_at: scheduled.process_at,
        }
    }
}

impl From<DistributedJob> for PendingJob {
    fn from(job: DistributedJob) -> Self {
        Self {
            key: job.key().unwrap_or_default().to_string(),
            id: Some(job.id),
            job_type: job.job_type,
            priority: job.priority,
            process_at: job.process_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EngineStats {
    Legacy(WarmerStats),
    Integrated(RouterMetrics),
}

/// Operations the cache manager dispatches to the active engine.
///
/// Eviction and validation jobs default to `JobUnsupported`; only engines
/// that can persist them override those methods.
#[async_trait]
pub trait WarmupEngine: Send + Sync {
    fn mode(&self) -> WarmingMode;

    fn is_running(&self) -> bool;

    async fn start(&self);

    async fn stop(&self);

    /// Trigger a full warm pass. Returns how many jobs were dispatched.
    async fn warmup_cache(&self) -> CacheResult<usize>;

    async fn enqueue_warmup(&self, job: WarmupJob) -> CacheResult<()>;

    async fn enqueue_scheduled_warmup(
        &self,
        job: WarmupJob,
        process_at: DateTime<Utc>,
    ) -> CacheResult<()>;

    async fn enqueue_eviction(&self, _key_or_pattern: &str, _priority: i32) -> CacheResult<()> {
        Err(CacheError::job_unsupported(JobType::Eviction, self.mode()))
    }

    async fn enqueue_validation(
        &self,
        _key: &str,
        _expected: Value,
        _priority: i32,
    ) -> CacheResult<()> {
        Err(CacheError::job_unsupported(JobType::Validation, self.mode()))
    }

    async fn queue_sizes(&self) -> CacheResult<QueueSizes>;

    /// Deferred jobs, earliest first.
    async fn pending_jobs(&self) -> CacheResult<Vec<PendingJob>>;

    async fn dead_letters(&self, _limit: usize) -> CacheResult<Vec<DeadLetterEntry>> {
        Ok(Vec::new())
    }

    fn stats(&self) -> EngineStats;

    /// Swap the warming strategy. The engine must be stopped.
    fn reconfigure(&self, strategy: WarmupStrategy) -> CacheResult<()>;

    async fn health(&self) -> CacheResult<()>;
}

#[async_trait]
impl WarmupEngine for CacheWarmer {
    fn mode(&self) -> WarmingMode {
        WarmingMode::Legacy
    }

    fn is_running(&self) -> bool {
        CacheWarmer::is_running(self)
    }

    async fn start(&self) {
        CacheWarmer::start(self).await;
    }

    async fn stop(&self) {
        CacheWarmer::stop(self).await;
    }

    async fn warmup_cache(&self) -> CacheResult<usize> {
        Ok(self.warm_cache_manually().await)
    }

    async fn enqueue_warmup(&self, job: WarmupJob) -> CacheResult<()> {
        self.add_warmup_job(job).await;
        Ok(())
    }

    async fn enqueue_scheduled_warmup(
        &self,
        job: WarmupJob,
        process_at: DateTime<Utc>,
    ) -> CacheResult<()> {
        self.schedule_warmup_at(job, process_at).await;
        Ok(())
    }

    async fn queue_sizes(&self) -> CacheResult<QueueSizes> {
        let mut sizes = QueueSizes::new();
        sizes.insert(LOCAL_QUEUE.to_string(), self.queue().len() as u64);
        Ok(sizes)
    }

    async fn pending_jobs(&self) -> CacheResult<Vec<PendingJob>> {
        Ok(self
            .pending_scheduled()
            .into_iter()
            .map(PendingJob::from)
            .collect())
    }

    fn stats(&self) -> EngineStats {
        EngineStats::Legacy(self.get_stats())
    }

    fn reconfigure(&self, strategy: WarmupStrategy) -> CacheResult<()> {
        CacheWarmer::reconfigure(self, strategy)
    }

    async fn health(&self) -> CacheResult<()> {
        if self.is_healthy().await {
            Ok(())
        } else {
            Err(CacheError::unavailable("cache health check failed"))
        }
    }
}

#[async_trait]
impl WarmupEngine for DistributedJobRouter {
    fn mode(&self) -> WarmingMode {
        WarmingMode::Integrated
    }

    fn is_running(&self) -> bool {
        DistributedJobRouter::is_running(self)
    }

    async fn start(&self) {
        DistributedJobRouter::start(self).await;
    }

    async fn stop(&self) {
        DistributedJobRouter::stop(self).await;
    }

    async fn warmup_cache(&self) -> CacheResult<usize> {
        DistributedJobRouter::warmup_cache(self).await
    }

    async fn enqueue_warmup(&self, job: WarmupJob) -> CacheResult<()> {
        DistributedJobRouter::enqueue_warmup(self, &job.key, job.data, job.ttl, job.priority)
            .await
            .map(drop)
    }

    async fn enqueue_scheduled_warmup(
        &self,
        job: WarmupJob,
        process_at: DateTime<Utc>,
    ) -> CacheResult<()> {
        DistributedJobRouter::enqueue_scheduled_warmup(
            self,
            &job.key,
            job.data,
            job.ttl,
            process_at,
            job.priority,
        )
        .await
        .map(drop)
    }

    async fn enqueue_eviction(&self, key_or_pattern: &str, priority: i32) -> CacheResult<()> {
        DistributedJobRouter::enqueue_eviction(self, key_or_pattern, priority)
            .await
            .map(drop)
    }

    async fn enqueue_validation(
        &self,
        key: &str,
        expected: Value,
        priority: i32,
    ) -> CacheResult<()> {
        DistributedJobRouter::enqueue_validation(self, key, expected, priority)
            .await
            .map(drop)
    }

    async fn queue_sizes(&self) -> CacheResult<QueueSizes> {
        DistributedJobRouter::queue_sizes(self).await
    }

    async fn pending_jobs(&self) -> CacheResult<Vec<PendingJob>> {
        Ok(self
            .scheduled_jobs()
            .await?
            .into_iter()
            .map(PendingJob::from)
            .collect())
    }

    async fn dead_letters(&self, limit: usize) -> CacheResult<Vec<DeadLetterEntry>> {
        DistributedJobRouter::dead_letters(self, limit).await
    }

    fn stats(&self) -> EngineStats {
        EngineStats::Integrated(self.metrics())
    }

    fn reconfigure(&self, strategy: WarmupStrategy) -> CacheResult<()> {
        DistributedJobRouter::reconfigure(self, None, &strategy)
    }

    async fn health(&self) -> CacheResult<()> {
        DistributedJobRouter::health(self).await
    }
}

/// The engine selected for a manager's lifetime.
pub enum ActiveEngine {
    Legacy(CacheWarmer),
    Integrated(DistributedJobRouter),
}

impl ActiveEngine {
    pub fn as_engine(&self) -> &dyn WarmupEngine {
        match self {
            ActiveEngine::Legacy(warmer) => warmer,
            ActiveEngine::Integrated(router) => router,
        }
    }

    pub fn mode(&self) -> WarmingMode {
        self.as_engine().mode()
    }
}
