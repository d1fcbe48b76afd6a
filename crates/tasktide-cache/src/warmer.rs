//! Local-only warming engine.
//!
//! Jobs live in a [`PriorityQueue`]. Each warm pass takes a snapshot of the
//! queue (the queue itself is left intact, so jobs are re-applied on every
//! pass) and hands it to the worker pool, or applies it inline in batches when
//! no pool is configured. Passes are driven by the scheduler's interval
//! trigger, or by a plain ticker when no scheduler is configured.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::backend::Cache;
use crate::config::WarmingConfig;
use crate::error::{CacheError, CacheResult};
use crate::job::{HealthCheck, WarmupJob};
use crate::metrics;
use crate::priority_queue::PriorityQueue;
use crate::scheduler::{JobScheduler, JobSource, ScheduledJob, SchedulerStats};
use crate::worker_pool::{BatchApplier, JobSink, WorkerPool, WorkerPoolStats};

/// How the local warmer runs.
#[derive(Clone)]
pub struct WarmupStrategy {
    /// Jobs seeded into the queue.
    pub jobs: Vec<WarmupJob>,
    pub batch_size: usize,
    pub concurrent_jobs: usize,
    /// Period between warm passes. Zero disables periodic passes.
    pub warmup_interval: Duration,
    /// Gate for periodic passes. Defaults to the cache's own health check.
    pub health_check: Option<HealthCheck>,
    pub use_worker_pool: bool,
    pub use_scheduler: bool,
    pub scheduled_check_interval: Duration,
}

impl std::fmt::Debug for WarmupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupStrategy")
            .field("jobs", &self.jobs.len())
            .field("batch_size", &self.batch_size)
            .field("concurrent_jobs", &self.concurrent_jobs)
            .field("warmup_interval", &self.warmup_interval)
            .field("health_check", &self.health_check.is_some())
            .field("use_worker_pool", &self.use_worker_pool)
            .field("use_scheduler", &self.use_scheduler)
            .field("scheduled_check_interval", &self.scheduled_check_interval)
            .finish()
    }
}

impl Default for WarmupStrategy {
    fn default() -> Self {
        Self::from_config(&WarmingConfig::default())
    }
}

impl WarmupStrategy {
    pub fn from_config(config: &WarmingConfig) -> Self {
        Self {
            jobs: Vec::new(),
            batch_size: config.batch_size,
            concurrent_jobs: config.concurrent_jobs,
            warmup_interval: config.warmup_interval(),
            health_check: None,
            use_worker_pool: config.use_worker_pool,
            use_scheduler: config.use_scheduler,
            scheduled_check_interval: config.scheduled_check_interval(),
        }
    }

    pub fn with_jobs(mut self, jobs: Vec<WarmupJob>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmerStats {
    pub running: bool,
    pub interval_secs: u64,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub concurrent_jobs: usize,
    pub use_worker_pool: bool,
    pub use_scheduler: bool,
    pub passes: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub worker_pool: Option<WorkerPoolStats>,
    pub scheduler: Option<SchedulerStats>,
}

/// Pool, scheduler and batch fallback built from one strategy.
struct Components {
    strategy: WarmupStrategy,
    pool: Option<Arc<WorkerPool>>,
    batch: Arc<BatchApplier>,
    scheduler: Option<Arc<JobScheduler>>,
    health: HealthCheck,
}

impl Components {
    fn build(cache: &Arc<dyn Cache>, queue: &Arc<PriorityQueue>, strategy: WarmupStrategy) -> Self {
        let pool = strategy
            .use_worker_pool
            .then(|| Arc::new(WorkerPool::new(cache.clone(), strategy.concurrent_jobs)));
        let batch = Arc::new(BatchApplier::new(
            cache.clone(),
            strategy.batch_size,
            strategy.concurrent_jobs,
        ));
        let health = strategy
            .health_check
            .clone()
            .unwrap_or_else(|| cache_health(cache.clone()));

        let scheduler = strategy.use_scheduler.then(|| {
            let sink: Arc<dyn JobSink> = match &pool {
                Some(pool) => pool.clone(),
                None => batch.clone(),
            };
            let scheduler = JobScheduler::new(sink, strategy.scheduled_check_interval);
            if !strategy.warmup_interval.is_zero() {
                let snapshot = queue.clone();
                let source: JobSource = Arc::new(move || snapshot.sorted_snapshot());
                scheduler.add_interval_trigger(
                    "warmup",
                    strategy.warmup_interval,
                    health.clone(),
                    source,
                );
            }
            Arc::new(scheduler)
        });

        Self {
            strategy,
            pool,
            batch,
            scheduler,
            health,
        }
    }

    /// Apply a set of jobs through the pool if it is running, inline otherwise.
    async fn dispatch(&self, jobs: Vec<WarmupJob>) -> usize {
        match self.pool.as_ref().filter(|pool| pool.is_running()) {
            Some(pool) => pool.submit_jobs(jobs),
            None => self.batch.apply(jobs).await,
        }
    }
}

async fn shutdown(components: &Components, ticker: Option<Ticker>) {
    if let Some(scheduler) = &components.scheduler {
        scheduler.stop().await;
    }
    if let Some((shutdown_tx, handle)) = ticker {
        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "warmup ticker panicked");
        }
    }
    if let Some(pool) = &components.pool {
        pool.stop().await;
    }
}

/// Health check backed by [`Cache::health`].
pub fn cache_health(cache: Arc<dyn Cache>) -> HealthCheck {
    Arc::new(move || {
        let cache = cache.clone();
        Box::pin(async move { cache.health().await.is_ok() })
    })
}

#[derive(Default)]
struct RunState {
    running: bool,
    /// Bumped by every start, so a start can tell it was stopped midway.
    generation: u64,
    ticker: Option<Ticker>,
}

type Ticker = (watch::Sender<bool>, JoinHandle<()>);

#[derive(Default)]
struct PassCounters {
    passes: AtomicU64,
    last_pass_at: Mutex<Option<DateTime<Utc>>>,
}

impl PassCounters {
    fn record(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        *self.last_pass_at.lock() = Some(Utc::now());
    }
}

pub struct CacheWarmer {
    cache: Arc<dyn Cache>,
    queue: Arc<PriorityQueue>,
    components: RwLock<Arc<Components>>,
    state: Mutex<RunState>,
    counters: Arc<PassCounters>,
}

impl CacheWarmer {
    pub fn new(cache: Arc<dyn Cache>, strategy: WarmupStrategy) -> Self {
        let queue = Arc::new(PriorityQueue::new());
        for job in &strategy.jobs {
            queue.push(job.clone());
        }
        let components = Components::build(&cache, &queue, strategy);
        Self {
            cache,
            queue,
            components: RwLock::new(Arc::new(components)),
            state: Mutex::new(RunState::default()),
            counters: Arc::new(PassCounters::default()),
        }
    }

    fn components(&self) -> Arc<Components> {
        self.components.read().clone()
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Queue a job for every future pass. While running with a scheduler the
    /// job is also applied right away.
    pub async fn add_warmup_job(&self, job: WarmupJob) {
        debug!(key = %job.key, priority = job.priority, "added warmup job");
        self.queue.push(job.clone());
        metrics::set_queue_depth("local", self.queue.len() as u64);

        if !self.is_running() {
            return;
        }
        let components = self.components();
        if let Some(scheduler) = components.scheduler.as_ref().filter(|s| s.is_running()) {
            scheduler.schedule_job(job).await;
        }
    }

    /// Apply a job once at `process_at`.
    ///
    /// Without a scheduler there is nothing to hold the job, so it is applied
    /// immediately.
    pub async fn schedule_warmup_at(&self, job: WarmupJob, process_at: DateTime<Utc>) {
        let components = self.components();
        match &components.scheduler {
            Some(scheduler) => scheduler.schedule_at(job, process_at),
            None => {
                warn!(key = %job.key, %process_at, "no scheduler configured, applying deferred job now");
                components.dispatch(vec![job]).await;
            }
        }
    }

    /// Deferred jobs not yet applied, earliest first.
    pub fn pending_scheduled(&self) -> Vec<ScheduledJob> {
        self.components()
            .scheduler
            .as_ref()
            .map(|s| s.pending_jobs())
            .unwrap_or_default()
    }

    /// Drop a job from the queue and any deferred copies of it.
    pub fn remove_job(&self, key: &str) -> bool {
        let mut removed = false;
        while self.queue.remove(key).is_some() {
            removed = true;
        }
        if let Some(scheduler) = &self.components().scheduler {
            removed |= scheduler.cancel(key) > 0;
        }
        removed
    }

    pub async fn start(&self) {
        let generation = {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
            state.generation += 1;
            state.generation
        };

        let components = self.components();
        info!(jobs = self.queue.len(), "Starting cache warmer");

        if let Some(pool) = &components.pool {
            pool.start();
        }

        if let Some(scheduler) = &components.scheduler {
            scheduler.start();
            let accepted = scheduler.schedule_jobs(self.queue.sorted_snapshot()).await;
            self.counters.record();
            debug!(accepted, "initial warm pass scheduled");
            if !self.is_current(generation) {
                debug!("cache warmer stopped while starting");
                shutdown(&components, None).await;
            }
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_ticker(
            self.queue.clone(),
            components.clone(),
            self.counters.clone(),
            shutdown_rx,
        );
        let orphaned = {
            let mut state = self.state.lock();
            if state.running && state.generation == generation {
                state.ticker = Some((shutdown_tx, handle));
                None
            } else {
                Some((shutdown_tx, handle))
            }
        };
        if let Some(ticker) = orphaned {
            debug!("cache warmer stopped while starting");
            shutdown(&components, Some(ticker)).await;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.running && state.generation == generation
    }

    /// Stop the scheduler (flushing due jobs), then the ticker, then drain the pool.
    pub async fn stop(&self) {
        let ticker = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.ticker.take()
        };

        shutdown(&self.components(), ticker).await;
        info!("Cache warmer stopped");
    }

    /// Run a full pass now, plus any deferred jobs that are due.
    ///
    /// Works while stopped: jobs are then applied inline.
    pub async fn warm_cache_manually(&self) -> usize {
        let components = self.components();
        let scheduled = match &components.scheduler {
            Some(scheduler) if scheduler.is_running() => scheduler.process_scheduled_jobs().await,
            _ => 0,
        };
        let jobs = self.queue.sorted_snapshot();
        let dispatched = components.dispatch(jobs).await;
        self.counters.record();
        info!(dispatched, scheduled, "manual cache warm pass");
        dispatched + scheduled
    }

    pub fn get_stats(&self) -> WarmerStats {
        let components = self.components();
        let strategy = &components.strategy;
        WarmerStats {
            running: self.is_running(),
            interval_secs: strategy.warmup_interval.as_secs(),
            queue_depth: self.queue.len(),
            batch_size: strategy.batch_size,
            concurrent_jobs: strategy.concurrent_jobs,
            use_worker_pool: strategy.use_worker_pool,
            use_scheduler: strategy.use_scheduler,
            passes: self.counters.passes.load(Ordering::Relaxed),
            last_pass_at: *self.counters.last_pass_at.lock(),
            worker_pool: components.pool.as_ref().map(|p| p.stats()),
            scheduler: components.scheduler.as_ref().map(|s| s.stats()),
        }
    }

    /// Swap in a new strategy. Only allowed while stopped.
    ///
    /// A non-empty `strategy.jobs` replaces the queue contents. Deferred jobs
    /// carry over to the new scheduler; without one they join the queue.
    pub fn reconfigure(&self, strategy: WarmupStrategy) -> CacheResult<()> {
        if self.is_running() {
            return Err(CacheError::invalid_config(
                "cannot reconfigure a running cache warmer",
            ));
        }

        let pending = self.pending_scheduled();
        if !strategy.jobs.is_empty() {
            self.queue.clear();
            for job in &strategy.jobs {
                self.queue.push(job.clone());
            }
        }

        let components = Components::build(&self.cache, &self.queue, strategy);
        for scheduled in pending {
            match &components.scheduler {
                Some(scheduler) => scheduler.schedule_at(scheduled.job, scheduled.process_at),
                None => self.queue.push(scheduled.job),
            }
        }
        debug!(strategy = ?components.strategy, "cache warmer reconfigured");
        *self.components.write() = Arc::new(components);
        Ok(())
    }

    /// Evaluate the pass gate.
    pub async fn is_healthy(&self) -> bool {
        let health = self.components().health.clone();
        health().await
    }
}

fn spawn_ticker(
    queue: Arc<PriorityQueue>,
    components: Arc<Components>,
    counters: Arc<PassCounters>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = components.strategy.warmup_interval;
        let dispatched = components.dispatch(queue.sorted_snapshot()).await;
        counters.record();
        debug!(dispatched, "initial warm pass");

        if period.is_zero() {
            // Periodic passes disabled; only wait for shutdown.
            while shutdown.changed().await.is_ok() && !*shutdown.borrow() {}
            return;
        }

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
                    if !(components.health)().await {
                        debug!("health check failed, skipping warm pass");
                        continue;
                    }
                    let dispatched = components.dispatch(queue.sorted_snapshot()).await;
                    counters.record();
                    debug!(dispatched, "periodic warm pass");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheExt, TwoTierCache};
    use crate::config::LocalCacheConfig;
    use serde_json::{Value, json};

    fn cache() -> Arc<TwoTierCache> {
        Arc::new(TwoTierCache::new_local(&LocalCacheConfig::default()))
    }

    fn job(key: &str, priority: i32) -> WarmupJob {
        WarmupJob::new(key, json!({"key": key}), Duration::from_secs(3600), priority)
    }

    fn strategy(use_worker_pool: bool, use_scheduler: bool) -> WarmupStrategy {
        WarmupStrategy {
            warmup_interval: Duration::from_millis(50),
            scheduled_check_interval: Duration::from_millis(10),
            use_worker_pool,
            use_scheduler,
            ..WarmupStrategy::default()
        }
    }

    #[tokio::test]
    async fn test_start_warms_seeded_jobs() {
        for (pool, scheduler) in [(true, true), (true, false), (false, true), (false, false)] {
            let cache = cache();
            let warmer = CacheWarmer::new(
                cache.clone(),
                strategy(pool, scheduler).with_jobs(vec![job("a", 1), job("b", 2)]),
            );
            warmer.start().await;
            tokio::time::sleep(Duration::from_millis(20)).await;

            let a: Option<Value> = cache.get_value("a").await.unwrap();
            assert_eq!(a, Some(json!({"key": "a"})), "pool={pool} scheduler={scheduler}");
            assert!(cache.local_tier().contains("b"));
            warmer.stop().await;
            assert!(!warmer.is_running());
            // Passes never consume the queue.
            assert_eq!(warmer.queue().len(), 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_racing_start_leaves_no_ticker_behind() {
        let warmer = Arc::new(CacheWarmer::new(cache(), strategy(false, false)));
        for _ in 0..50 {
            let starting = tokio::spawn({
                let warmer = warmer.clone();
                async move { warmer.start().await }
            });
            let stopping = tokio::spawn({
                let warmer = warmer.clone();
                async move { warmer.stop().await }
            });
            starting.await.unwrap();
            stopping.await.unwrap();

            let state = warmer.state.lock();
            assert_eq!(state.running, state.ticker.is_some());
            drop(state);
            warmer.stop().await;
            assert!(warmer.state.lock().ticker.is_none());
        }
    }

    #[tokio::test]
    async fn test_add_job_while_running_applies_immediately() {
        let cache = cache();
        let warmer = CacheWarmer::new(cache.clone(), strategy(true, true));
        warmer.start().await;
        warmer.add_warmup_job(job("late", 3)).await;
        warmer.stop().await;
        assert!(cache.local_tier().contains("late"));
    }

    #[tokio::test]
    async fn test_manual_warm_when_stopped() {
        let cache = cache();
        let warmer = CacheWarmer::new(cache.clone(), strategy(true, true));
        warmer.add_warmup_job(job("x", 1)).await;
        assert!(!cache.local_tier().contains("x"));

        assert_eq!(warmer.warm_cache_manually().await, 1);
        assert!(cache.local_tier().contains("x"));
        assert_eq!(warmer.get_stats().passes, 1);
    }

    #[tokio::test]
    async fn test_deferred_job_survives_restart() {
        let cache = cache();
        let warmer = CacheWarmer::new(cache.clone(), strategy(true, true));
        warmer
            .schedule_warmup_at(job("future", 1), Utc::now() + chrono::Duration::hours(1))
            .await;
        warmer.start().await;
        warmer.stop().await;
        assert_eq!(warmer.pending_scheduled().len(), 1);
        assert!(!cache.local_tier().contains("future"));
    }

    #[tokio::test]
    async fn test_deferred_without_scheduler_applies_now() {
        let cache = cache();
        let warmer = CacheWarmer::new(cache.clone(), strategy(false, false));
        warmer
            .schedule_warmup_at(job("now", 1), Utc::now() + chrono::Duration::hours(1))
            .await;
        assert!(cache.local_tier().contains("now"));
        assert!(warmer.pending_scheduled().is_empty());
    }

    #[tokio::test]
    async fn test_reconfigure_requires_stopped() {
        let warmer = CacheWarmer::new(cache(), strategy(true, true));
        warmer
            .schedule_warmup_at(job("kept", 1), Utc::now() + chrono::Duration::hours(1))
            .await;
        warmer.start().await;
        assert!(warmer.reconfigure(strategy(false, true)).is_err());
        warmer.stop().await;

        let new_strategy = WarmupStrategy {
            batch_size: 5,
            ..strategy(false, true)
        };
        warmer.reconfigure(new_strategy).unwrap();
        let stats = warmer.get_stats();
        assert_eq!(stats.batch_size, 5);
        assert!(!stats.use_worker_pool);
        assert!(stats.worker_pool.is_none());
        assert_eq!(warmer.pending_scheduled()[0].job.key, "kept");
    }

    #[tokio::test]
    async fn test_unhealthy_gate_skips_periodic_passes() {
        let cache = cache();
        let gate: HealthCheck = Arc::new(|| Box::pin(async { false }));
        let warmer = CacheWarmer::new(
            cache.clone(),
            strategy(false, false)
                .with_jobs(vec![job("a", 1)])
                .with_health_check(gate),
        );
        warmer.start().await;
        tokio::time::sleep(Duration::from_millis(130)).await;
        warmer.stop().await;
        // Only the initial pass ran.
        assert_eq!(warmer.get_stats().passes, 1);
        assert!(!warmer.is_healthy().await);
    }
}
