//! Fixed-size pool of warmup executors.
//!
//! `N` tokio tasks pull from one unbounded channel whose receiver sits behind a
//! `tokio::sync::Mutex`. Submitting never blocks. Stopping drops the sender, so
//! workers drain every job already submitted before they exit.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{Cache, CacheExt};
use crate::job::WarmupJob;
use crate::metrics;

/// Something that accepts warmup jobs for execution.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Hand jobs over, returning the ones that were not accepted.
    async fn submit(&self, jobs: Vec<WarmupJob>) -> Vec<WarmupJob>;
}

/// Apply one job to the cache. Failures are logged and counted, never retried.
pub(crate) async fn apply_job(cache: &dyn Cache, job: &WarmupJob) -> bool {
    match cache.set_value(&job.key, &job.data, job.ttl).await {
        Ok(()) => {
            tracing::debug!(key = %job.key, priority = job.priority, "warmup job applied");
            metrics::record_warmup_job("local", true);
            true
        }
        Err(e) => {
            tracing::warn!(key = %job.key, error = %e, "warmup job failed");
            metrics::record_warmup_job("local", false);
            false
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    sender: Option<mpsc::UnboundedSender<WarmupJob>>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub running: bool,
    pub submitted: u64,
    pub processed: u64,
    pub failed: u64,
    /// Submitted but not yet finished.
    pub pending: u64,
}

pub struct WorkerPool {
    cache: Arc<dyn Cache>,
    workers: usize,
    state: Mutex<PoolState>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(cache: Arc<dyn Cache>, workers: usize) -> Self {
        Self {
            cache,
            workers: workers.max(1),
            state: Mutex::new(PoolState::default()),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Spawn the workers. No-op if already running.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.sender.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel::<WarmupJob>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        state.handles = (0..self.workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let cache = self.cache.clone();
                let counters = self.counters.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(job) = next else { break };
                        if apply_job(cache.as_ref(), &job).await {
                            counters.processed.fetch_add(1, Ordering::Relaxed);
                        } else {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    tracing::debug!(worker_id, "warmup worker stopped");
                })
            })
            .collect();
        state.sender = Some(tx);

        tracing::info!(workers = self.workers, "Worker pool started");
    }

    /// Stop accepting jobs and wait until every submitted job has been applied.
    /// No-op if not running.
    pub async fn stop(&self) {
        let handles = {
            let mut state = self.state.lock();
            if state.sender.take().is_none() {
                return;
            }
            std::mem::take(&mut state.handles)
        };

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "warmup worker panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().sender.is_some()
    }

    /// Queue jobs for the workers. Returns 0 if the pool is not running.
    pub fn submit_jobs(&self, jobs: Vec<WarmupJob>) -> usize {
        let count = jobs.len();
        count - self.offer(jobs).len()
    }

    /// Queue what the pool will take and hand back the rest.
    fn offer(&self, jobs: Vec<WarmupJob>) -> Vec<WarmupJob> {
        let state = self.state.lock();
        let Some(sender) = &state.sender else {
            tracing::warn!(jobs = jobs.len(), "worker pool not running, jobs rejected");
            return jobs;
        };

        let mut rejected = Vec::new();
        let mut accepted = 0u64;
        for job in jobs {
            match sender.send(job) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::SendError(job)) => rejected.push(job),
            }
        }
        self.counters
            .submitted
            .fetch_add(accepted, Ordering::Relaxed);
        rejected
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let submitted = self.counters.submitted.load(Ordering::Relaxed);
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        WorkerPoolStats {
            workers: self.workers,
            running: self.is_running(),
            submitted,
            processed,
            failed,
            pending: submitted.saturating_sub(processed + failed),
        }
    }
}

#[async_trait]
impl JobSink for WorkerPool {
    async fn submit(&self, jobs: Vec<WarmupJob>) -> Vec<WarmupJob> {
        self.offer(jobs)
    }
}

/// Applies jobs inline in batches of `batch_size`, `concurrency` at a time.
/// Used when no worker pool is configured.
pub struct BatchApplier {
    cache: Arc<dyn Cache>,
    batch_size: usize,
    concurrency: usize,
}

impl BatchApplier {
    pub fn new(cache: Arc<dyn Cache>, batch_size: usize, concurrency: usize) -> Self {
        Self {
            cache,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Apply all jobs, returning how many succeeded.
    pub async fn apply(&self, jobs: Vec<WarmupJob>) -> usize {
        let total = jobs.len();
        let mut succeeded = 0;
        for batch in jobs.chunks(self.batch_size) {
            let ok = AtomicU64::new(0);
            stream::iter(batch)
                .for_each_concurrent(self.concurrency, |job| {
                    let ok = &ok;
                    async move {
                        if apply_job(self.cache.as_ref(), job).await {
                            ok.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
                .await;
            succeeded += ok.into_inner() as usize;
        }
        tracing::debug!(total, succeeded, "warmup batch applied");
        succeeded
    }
}

#[async_trait]
impl JobSink for BatchApplier {
    async fn submit(&self, jobs: Vec<WarmupJob>) -> Vec<WarmupJob> {
        self.apply(jobs).await;
        Vec::new()
    }
}
