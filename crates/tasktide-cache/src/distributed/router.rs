//! Distributed job router.
//!
//! Producers push [`DistributedJob`]s into a [`JobQueue`]; `workers` tokio
//! tasks poll it, claim due jobs of every type, run the highest priority first
//! and apply them to the cache. Failed jobs are pushed back with exponential
//! backoff until `max_tries`, then moved to the dead-letter store.
//!
//! Queue calls go through the router's own circuit breaker. When an enqueue
//! fails and `local_fallback` is on, the job is executed against the cache
//! right away instead of being lost.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use super::job::{DeadLetterEntry, DistributedJob, JobType};
use super::queue::{JobQueue, QueueSizes};
use crate::backend::{Cache, CacheExt};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::config::WarmingConfig;
use crate::error::{CacheError, CacheResult};
use crate::job::{HealthCheck, WarmupJob};
use crate::metrics;
use crate::warmer::{WarmupStrategy, cache_health};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runtime knobs of the router.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterSettings {
    /// Number of polling workers.
    pub workers: usize,
    /// Jobs claimed per type per poll.
    pub claim_batch: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub max_tries: u32,
    pub retry_base_delay: Duration,
    pub local_fallback: bool,
    /// Period of the strategy re-feed. Zero disables it.
    pub warmup_interval: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&WarmingConfig::default())
    }
}

impl RouterSettings {
    pub fn from_config(config: &WarmingConfig) -> Self {
        Self {
            workers: config.concurrent_jobs.max(1),
            claim_batch: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
            job_timeout: config.job_timeout(),
            max_tries: config.max_tries.max(1),
            retry_base_delay: config.retry_base_delay(),
            local_fallback: config.local_fallback,
            warmup_interval: config.warmup_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterMetrics {
    pub running: bool,
    pub workers: usize,
    pub queue_backend: &'static str,
    /// `false` while the queue breaker is rejecting calls.
    pub queue_available: bool,
    pub strategy_jobs: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Jobs that could be neither requeued nor dead-lettered
    pub dropped: u64,
    pub fallback_executed: u64,
    pub validation_mismatches: u64,
    pub breaker: CircuitBreakerStats,
}

#[derive(Debug, Default)]
struct RouterCounters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    fallback_executed: AtomicU64,
    validation_mismatches: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Settings plus the recurring job set and its health gate.
#[derive(Clone)]
struct RouterPlan {
    settings: RouterSettings,
    jobs: Vec<WarmupJob>,
    health: HealthCheck,
}

struct RouterCore {
    cache: Arc<dyn Cache>,
    queue: Arc<dyn JobQueue>,
    breaker: CircuitBreaker,
    plan: RwLock<RouterPlan>,
    counters: RouterCounters,
}

impl RouterCore {
    fn settings(&self) -> RouterSettings {
        self.plan.read().settings.clone()
    }

    async fn enqueue(&self, mut job: DistributedJob) -> CacheResult<String> {
        let settings = self.settings();
        job.max_tries = settings.max_tries;
        let id = job.id.clone();

        let pushed = self.breaker.execute(|| self.queue.push(&job)).await;
        match pushed {
            Ok(()) => {
                bump(&self.counters.enqueued);
                debug!(job_id = %id, job_type = %job.job_type, priority = job.priority, "job routed");
                Ok(id)
            }
            Err(e) if settings.local_fallback => {
                warn!(job_id = %id, error = %e, "job queue unavailable, executing job locally");
                bump(&self.counters.fallback_executed);
                self.execute(&job).await?;
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply one job to the cache.
    async fn execute(&self, job: &DistributedJob) -> CacheResult<()> {
        let key = job.key().ok_or_else(|| {
            CacheError::serialization(format!("job {} payload has no key", job.id))
        })?;

        match job.job_type {
            JobType::Warmup => self.cache.set_value(key, job.data(), job.ttl()).await,
            JobType::Eviction if key.contains('*') => {
                let deleted = self.cache.delete_pattern(key).await?;
                debug!(pattern = %key, deleted, "eviction job applied");
                Ok(())
            }
            JobType::Eviction => self.cache.delete(key).await,
            JobType::Validation => {
                let expected = job.expected();
                let current: Option<Value> = self.cache.get_value(key).await?;
                if current.as_ref() == Some(expected) {
                    return Ok(());
                }
                bump(&self.counters.validation_mismatches);
                warn!(key = %key, cached = current.is_some(), "cached value failed validation, rewriting");
                self.cache.set_value(key, expected, job.ttl()).await
            }
        }
    }

    async fn run(&self, job: DistributedJob) {
        let limit = self.settings().job_timeout;
        let result = match tokio::time::timeout(limit, self.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::queue(format!(
                "job {} timed out after {}ms",
                job.id,
                limit.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                bump(&self.counters.processed);
                metrics::record_warmup_job("distributed", true);
                debug!(job_id = %job.id, job_type = %job.job_type, "job processed");
            }
            Err(e) => {
                bump(&self.counters.failed);
                metrics::record_warmup_job("distributed", false);
                self.handle_failure(job, e).await;
            }
        }
    }

    async fn handle_failure(&self, mut job: DistributedJob, err: CacheError) {
        let base = self.settings().retry_base_delay;
        if !(err.is_retryable() && job.schedule_retry(base)) {
            self.dead_letter(job, err.to_string()).await;
            return;
        }

        match self.breaker.execute(|| self.queue.push(&job)).await {
            Ok(()) => {
                bump(&self.counters.retried);
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_tries = job.max_tries,
                    process_at = %job.process_at,
                    error = %err,
                    "job failed, retry scheduled"
                );
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to requeue job for retry");
                self.dead_letter(job, format!("{err}; requeue failed: {e}")).await;
            }
        }
    }

    async fn dead_letter(&self, job: DistributedJob, error: String) {
        error!(job_id = %job.id, attempts = job.attempts, error = %error, "job moved to dead-letter queue");
        bump(&self.counters.dead_lettered);
        metrics::record_dead_letter(job.job_type.as_str());
        let entry = DeadLetterEntry::new(job, error);
        if let Err(e) = self.breaker.execute(|| self.queue.dead_letter(&entry)).await {
            bump(&self.counters.dropped);
            error!(job_id = %entry.original_job.id, error = %e, "failed to store dead letter, job dropped");
        }
    }

    /// Claim due jobs of every type and run them, highest priority first.
    /// Returns how many jobs were claimed.
    async fn poll_once(&self) -> usize {
        let limit = self.settings().claim_batch;
        let now = Utc::now();
        let mut jobs = Vec::new();
        for job_type in JobType::ALL {
            match self
                .breaker
                .execute(|| self.queue.claim_due(job_type, now, limit))
                .await
            {
                Ok(mut claimed) => jobs.append(&mut claimed),
                Err(e) if e.is_breaker_open() => break,
                Err(e) => {
                    warn!(job_type = %job_type, error = %e, "failed to claim jobs");
                    break;
                }
            }
        }

        jobs.sort_by(|a, b| b.priority.cmp(&a.priority));
        let claimed = jobs.len();
        for job in jobs {
            self.run(job).await;
        }
        claimed
    }

    async fn warmup(&self) -> CacheResult<usize> {
        let jobs = self.plan.read().jobs.clone();
        let mut routed = 0;
        let mut last_error = None;
        for job in jobs {
            let job = DistributedJob::warmup(job.key, job.data, job.ttl, job.priority);
            match self.enqueue(job).await {
                Ok(_) => routed += 1,
                Err(e) => {
                    warn!(error = %e, "failed to route strategy job");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if routed == 0 => Err(e),
            _ => Ok(routed),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Routes jobs through a persistent queue to a pool of polling workers.
pub struct DistributedJobRouter {
    core: Arc<RouterCore>,
    running: Mutex<Option<Running>>,
}

impl DistributedJobRouter {
    pub fn new(
        cache: Arc<dyn Cache>,
        queue: Arc<dyn JobQueue>,
        breaker: CircuitBreakerConfig,
        settings: RouterSettings,
    ) -> Self {
        let breaker = CircuitBreaker::new(format!("queue-{}", queue.name()), breaker);
        let health = cache_health(cache.clone());
        Self {
            core: Arc::new(RouterCore {
                cache,
                queue,
                breaker,
                plan: RwLock::new(RouterPlan {
                    settings,
                    jobs: Vec::new(),
                    health,
                }),
                counters: RouterCounters::default(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Take the recurring job set and health gate from a warming strategy.
    pub fn with_strategy(self, strategy: &WarmupStrategy) -> Self {
        self.apply_strategy(strategy);
        self
    }

    fn apply_strategy(&self, strategy: &WarmupStrategy) {
        let mut plan = self.core.plan.write();
        plan.settings.workers = strategy.concurrent_jobs.max(1);
        plan.settings.claim_batch = strategy.batch_size.max(1);
        plan.settings.warmup_interval = strategy.warmup_interval;
        if !strategy.jobs.is_empty() {
            plan.jobs = strategy.jobs.clone();
        }
        if let Some(health) = &strategy.health_check {
            plan.health = health.clone();
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.core.cache
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.core.queue
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.core.breaker
    }

    pub fn settings(&self) -> RouterSettings {
        self.core.settings()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the workers and the re-feed task, then route the strategy jobs
    /// once. No-op if already running.
    pub async fn start(&self) {
        let settings = self.core.settings();
        {
            let mut running = self.running.lock();
            if running.is_some() {
                return;
            }
            let (shutdown, rx) = watch::channel(false);
            let mut handles: Vec<JoinHandle<()>> = (0..settings.workers)
                .map(|worker_id| spawn_worker(self.core.clone(), worker_id, rx.clone()))
                .collect();
            if !settings.warmup_interval.is_zero() {
                handles.push(spawn_refeed(
                    self.core.clone(),
                    settings.warmup_interval,
                    rx,
                ));
            }
            *running = Some(Running { shutdown, handles });
        }

        info!(
            workers = settings.workers,
            queue = self.core.queue.name(),
            "Distributed job router started"
        );
        if let Err(e) = self.core.warmup().await {
            warn!(error = %e, "initial warmup routing failed");
        }
    }

    /// Signal every task and wait for it. Workers finish the batch they claimed.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "router task panicked");
            }
        }
        info!("Distributed job router stopped");
    }

    /// Route every strategy job as a warmup job. Returns how many were routed.
    pub async fn warmup_cache(&self) -> CacheResult<usize> {
        self.core.warmup().await
    }

    /// Route a prepared job. Returns its id.
    pub async fn enqueue_job(&self, job: DistributedJob) -> CacheResult<String> {
        self.core.enqueue(job).await
    }

    pub async fn enqueue_warmup(
        &self,
        key: &str,
        data: Value,
        ttl: Duration,
        priority: i32,
    ) -> CacheResult<String> {
        self.enqueue_job(DistributedJob::warmup(key, data, ttl, priority))
            .await
    }

    pub async fn enqueue_scheduled_warmup(
        &self,
        key: &str,
        data: Value,
        ttl: Duration,
        process_at: chrono::DateTime<Utc>,
        priority: i32,
    ) -> CacheResult<String> {
        let job = DistributedJob::warmup(key, data, ttl, priority).scheduled_at(process_at);
        self.enqueue_job(job).await
    }

    pub async fn enqueue_eviction(&self, key_or_pattern: &str, priority: i32) -> CacheResult<String> {
        self.enqueue_job(DistributedJob::eviction(key_or_pattern, priority))
            .await
    }

    pub async fn enqueue_validation(
        &self,
        key: &str,
        expected: Value,
        priority: i32,
    ) -> CacheResult<String> {
        self.enqueue_job(DistributedJob::validation(key, expected, priority))
            .await
    }

    /// Run one polling cycle on the caller's task. Returns jobs claimed.
    pub async fn process_due_jobs(&self) -> usize {
        self.core.poll_once().await
    }

    pub async fn queue_sizes(&self) -> CacheResult<QueueSizes> {
        let core = &self.core;
        let sizes = core.breaker.execute(|| core.queue.sizes()).await?;
        for (queue, depth) in &sizes {
            metrics::set_queue_depth(queue, *depth);
        }
        Ok(sizes)
    }

    /// Jobs waiting for a future `process_at`, earliest first.
    pub async fn scheduled_jobs(&self) -> CacheResult<Vec<DistributedJob>> {
        let core = &self.core;
        core.breaker.execute(|| core.queue.scheduled(Utc::now())).await
    }

    pub async fn dead_letters(&self, limit: usize) -> CacheResult<Vec<DeadLetterEntry>> {
        let core = &self.core;
        core.breaker.execute(|| core.queue.dead_letters(limit)).await
    }

    /// Liveness of the queue backend, through the breaker.
    pub async fn health(&self) -> CacheResult<()> {
        let core = &self.core;
        core.breaker.execute(|| core.queue.ping()).await
    }

    pub fn metrics(&self) -> RouterMetrics {
        let core = &self.core;
        let counters = &core.counters;
        let (workers, strategy_jobs) = {
            let plan = core.plan.read();
            (plan.settings.workers, plan.jobs.len())
        };
        RouterMetrics {
            running: self.is_running(),
            workers,
            queue_backend: core.queue.name(),
            queue_available: !core.breaker.is_rejecting(),
            strategy_jobs,
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            fallback_executed: counters.fallback_executed.load(Ordering::Relaxed),
            validation_mismatches: counters.validation_mismatches.load(Ordering::Relaxed),
            breaker: core.breaker.stats(),
        }
    }

    /// Swap settings and take jobs and health gate from `strategy`.
    /// Only allowed while stopped.
    pub fn reconfigure(
        &self,
        settings: Option<RouterSettings>,
        strategy: &WarmupStrategy,
    ) -> CacheResult<()> {
        if self.is_running() {
            return Err(CacheError::invalid_config(
                "cannot reconfigure a running job router",
            ));
        }
        if let Some(settings) = settings {
            self.core.plan.write().settings = settings;
        }
        self.apply_strategy(strategy);
        debug!(settings = ?self.settings(), "job router reconfigured");
        Ok(())
    }
}

fn spawn_worker(
    core: Arc<RouterCore>,
    worker_id: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = core.settings().poll_interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Keep claiming while a backlog remains.
                    while core.poll_once().await > 0 {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
        debug!(worker_id, "distributed worker stopped");
    })
}

fn spawn_refeed(
    core: Arc<RouterCore>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let health = core.plan.read().health.clone();
                    if !health().await {
                        debug!("health check failed, skipping strategy re-feed");
                        continue;
                    }
                    match core.warmup().await {
                        Ok(routed) => debug!(routed, "strategy jobs re-fed"),
                        Err(e) => warn!(error = %e, "strategy re-feed failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TwoTierCache;
    use crate::config::LocalCacheConfig;
    use crate::distributed::MemoryJobQueue;
    use crate::tier::MemoryRemoteTier;
    use serde_json::json;

    fn cache() -> Arc<TwoTierCache> {
        Arc::new(TwoTierCache::new_local(&LocalCacheConfig::default()))
    }

    fn settings() -> RouterSettings {
        RouterSettings {
            workers: 2,
            claim_batch: 10,
            poll_interval: Duration::from_millis(20),
            job_timeout: Duration::from_secs(1),
            max_tries: 3,
            retry_base_delay: Duration::from_millis(1),
            local_fallback: true,
            warmup_interval: Duration::ZERO,
        }
    }

    fn router(cache: Arc<TwoTierCache>, queue: Arc<MemoryJobQueue>) -> DistributedJobRouter {
        DistributedJobRouter::new(cache, queue, CircuitBreakerConfig::default(), settings())
    }

    #[tokio::test]
    async fn test_warmup_job_applied_by_poll() {
        let cache = cache();
        let queue = Arc::new(MemoryJobQueue::default());
        let router = router(cache.clone(), queue.clone());

        router
            .enqueue_warmup("k1", json!({"v": 1}), Duration::from_secs(3600), 5)
            .await
            .unwrap();
        assert_eq!(queue.sizes().await.unwrap()["warmup"], 1);

        assert_eq!(router.process_due_jobs().await, 1);
        let value: Option<Value> = cache.get_value("k1").await.unwrap();
        assert_eq!(value, Some(json!({"v": 1})));
        assert_eq!(router.metrics().processed, 1);
    }

    #[tokio::test]
    async fn test_eviction_by_pattern() {
        let cache = cache();
        for key in ["user_tasks:1", "user_tasks:2", "other:1"] {
            cache.set_value(key, &json!(1), Duration::from_secs(60)).await.unwrap();
        }
        let router = router(cache.clone(), Arc::new(MemoryJobQueue::default()));

        router.enqueue_eviction("user_tasks:*", 0).await.unwrap();
        router.process_due_jobs().await;

        assert!(!cache.exists("user_tasks:1").await.unwrap());
        assert!(!cache.exists("user_tasks:2").await.unwrap());
        assert!(cache.exists("other:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_validation_rewrites_mismatch() {
        let cache = cache();
        cache.set_value("k", &json!("stale"), Duration::from_secs(60)).await.unwrap();
        let router = router(cache.clone(), Arc::new(MemoryJobQueue::default()));

        router.enqueue_validation("k", json!("fresh"), 0).await.unwrap();
        router.enqueue_validation("k", json!("fresh"), 0).await.unwrap();
        router.process_due_jobs().await;

        let value: Option<Value> = cache.get_value("k").await.unwrap();
        assert_eq!(value, Some(json!("fresh")));
        assert_eq!(router.metrics().validation_mismatches, 1);
    }

    #[tokio::test]
    async fn test_higher_priority_runs_first() {
        let cache = cache();
        let queue = Arc::new(MemoryJobQueue::default());
        let router = router(cache.clone(), queue.clone());

        // Both write the same key; the later (lower priority) write wins.
        router.enqueue_warmup("k", json!("low"), Duration::from_secs(60), 1).await.unwrap();
        router.enqueue_warmup("k", json!("high"), Duration::from_secs(60), 9).await.unwrap();
        router.process_due_jobs().await;

        let value: Option<Value> = cache.get_value("k").await.unwrap();
        assert_eq!(value, Some(json!("low")));
    }

    #[tokio::test]
    async fn test_malformed_job_dead_lettered_immediately() {
        let queue = Arc::new(MemoryJobQueue::default());
        let router = router(cache(), queue.clone());

        let mut job = DistributedJob::warmup("k", json!(1), Duration::from_secs(60), 0);
        job.payload.remove("key");
        router.enqueue_job(job).await.unwrap();
        router.process_due_jobs().await;

        let dead = router.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("no key"));
        assert_eq!(router.metrics().retried, 0);
    }

    /// Accepts one push, then refuses pushes while everything else keeps working.
    struct OnePushQueue {
        inner: MemoryJobQueue,
        pushed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobQueue for OnePushQueue {
        fn name(&self) -> &'static str {
            "one-push"
        }

        async fn ping(&self) -> CacheResult<()> {
            self.inner.ping().await
        }

        async fn push(&self, job: &DistributedJob) -> CacheResult<()> {
            if self.pushed.swap(true, Ordering::SeqCst) {
                return Err(CacheError::queue("push refused"));
            }
            self.inner.push(job).await
        }

        async fn claim_due(
            &self,
            job_type: JobType,
            now: chrono::DateTime<Utc>,
            limit: usize,
        ) -> CacheResult<Vec<DistributedJob>> {
            self.inner.claim_due(job_type, now, limit).await
        }

        async fn dead_letter(&self, entry: &DeadLetterEntry) -> CacheResult<()> {
            self.inner.dead_letter(entry).await
        }

        async fn dead_letters(&self, limit: usize) -> CacheResult<Vec<DeadLetterEntry>> {
            self.inner.dead_letters(limit).await
        }

        async fn scheduled(&self, now: chrono::DateTime<Utc>) -> CacheResult<Vec<DistributedJob>> {
            self.inner.scheduled(now).await
        }

        async fn sizes(&self) -> CacheResult<QueueSizes> {
            self.inner.sizes().await
        }

        async fn clear(&self) -> CacheResult<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_failed_requeue_moves_job_to_dead_letters() {
        let remote = Arc::new(MemoryRemoteTier::new());
        remote.set_online(false);
        let cache = Arc::new(TwoTierCache::with_remote(
            remote,
            CircuitBreakerConfig::default(),
            &LocalCacheConfig::default(),
        ));
        let queue = Arc::new(OnePushQueue {
            inner: MemoryJobQueue::default(),
            pushed: std::sync::atomic::AtomicBool::new(false),
        });
        let router = DistributedJobRouter::new(cache, queue, CircuitBreakerConfig::default(), settings());

        router
            .enqueue_warmup("k", json!(1), Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert_eq!(router.process_due_jobs().await, 1);

        let metrics = router.metrics();
        assert_eq!(metrics.retried, 0);
        assert_eq!(metrics.dead_lettered, 1);
        assert_eq!(metrics.dropped, 0);
        let dead = router.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("requeue failed"));
        assert_eq!(dead[0].original_job.key(), Some("k"));
    }

    #[tokio::test]
    async fn test_failing_job_retried_then_dead_lettered() {
        let remote = Arc::new(MemoryRemoteTier::new());
        remote.set_online(false);
        let cache = Arc::new(TwoTierCache::with_remote(
            remote,
            CircuitBreakerConfig::default(),
            &LocalCacheConfig::default(),
        ));
        let queue = Arc::new(MemoryJobQueue::default());
        let mut settings = settings();
        settings.max_tries = 2;
        settings.retry_base_delay = Duration::from_millis(25);
        let router = DistributedJobRouter::new(cache, queue.clone(), CircuitBreakerConfig::default(), settings);

        router
            .enqueue_warmup("k", json!(1), Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert_eq!(router.process_due_jobs().await, 1);
        assert_eq!(router.metrics().retried, 1);
        assert_eq!(router.scheduled_jobs().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(router.process_due_jobs().await, 1);

        let metrics = router.metrics();
        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.dead_lettered, 1);
        let dead = router.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].original_job.attempts, 2);
        assert_eq!(queue.sizes().await.unwrap()["warmup"], 0);
    }

    #[tokio::test]
    async fn test_enqueue_falls_back_to_local_execution() {
        let cache = cache();
        let queue = Arc::new(MemoryJobQueue::default());
        queue.set_online(false);
        let router = router(cache.clone(), queue);

        router
            .enqueue_warmup("fallback", json!(true), Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert!(cache.exists("fallback").await.unwrap());
        assert_eq!(router.metrics().fallback_executed, 1);
    }

    #[tokio::test]
    async fn test_enqueue_without_fallback_fails() {
        let queue = Arc::new(MemoryJobQueue::default());
        queue.set_online(false);
        let mut settings = settings();
        settings.local_fallback = false;
        let router = DistributedJobRouter::new(cache(), queue, CircuitBreakerConfig::default(), settings);

        let err = router.enqueue_eviction("k", 0).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop() {
        let cache = cache();
        let queue = Arc::new(MemoryJobQueue::default());
        let router = router(cache.clone(), queue.clone());
        router.start().await;
        router.start().await;

        for i in 0..20 {
            router
                .enqueue_warmup(&format!("k{i}"), json!(i), Duration::from_secs(60), i)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        router.stop().await;

        assert!(!router.is_running());
        assert_eq!(router.metrics().processed, 20);
        assert_eq!(cache.local_tier().len(), 20);
        assert_eq!(queue.sizes().await.unwrap()["warmup"], 0);
    }

    #[tokio::test]
    async fn test_start_routes_strategy_jobs() {
        let cache = cache();
        let queue = Arc::new(MemoryJobQueue::default());
        let strategy = WarmupStrategy {
            warmup_interval: Duration::ZERO,
            ..WarmupStrategy::default()
        }
        .with_jobs(vec![WarmupJob::new("seed", json!(1), Duration::from_secs(60), 1)]);
        let router = router(cache.clone(), queue).with_strategy(&strategy);

        router.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        router.stop().await;

        assert!(cache.exists("seed").await.unwrap());
        assert_eq!(router.metrics().strategy_jobs, 1);
    }

    #[tokio::test]
    async fn test_reconfigure_rejected_while_running() {
        let router = router(cache(), Arc::new(MemoryJobQueue::default()));
        router.start().await;
        assert!(router.reconfigure(None, &WarmupStrategy::default()).is_err());
        router.stop().await;

        let strategy = WarmupStrategy {
            concurrent_jobs: 5,
            warmup_interval: Duration::ZERO,
            ..WarmupStrategy::default()
        };
        router.reconfigure(None, &strategy).unwrap();
        assert_eq!(router.settings().workers, 5);
    }
}
