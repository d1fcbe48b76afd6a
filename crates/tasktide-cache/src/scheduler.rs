//! Interval triggers and deferred one-shot warmup jobs.
//!
//! Each interval trigger runs on its own task and is gated by a health check:
//! a failed check skips that tick. Deferred jobs wait in a list until their
//! `process_at` passes, then go to the [`JobSink`].
//!
//! Stopping cancels every timer, then hands already-due jobs to the sink.
//! Jobs not yet due stay queued for the next start, as do due jobs the sink
//! turns away.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, warn};

use crate::job::{HealthCheck, WarmupJob};
use crate::worker_pool::JobSink;

/// Produces the jobs an interval trigger feeds to the sink on each tick.
pub type JobSource = Arc<dyn Fn() -> Vec<WarmupJob> + Send + Sync>;

/// A job held until `process_at`.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job: WarmupJob,
    pub process_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TriggerCounters {
    runs: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Clone)]
struct IntervalTrigger {
    name: String,
    period: Duration,
    health: HealthCheck,
    source: JobSource,
    counters: Arc<TriggerCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerStats {
    pub name: String,
    pub period_ms: u64,
    pub runs: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub triggers: Vec<TriggerStats>,
    pub pending_scheduled: usize,
    pub dispatched: u64,
    /// Due jobs the sink rejected and that were kept for a later dispatch
    pub requeued: u64,
}

struct Shared {
    sink: Arc<dyn JobSink>,
    check_interval: Duration,
    scheduled: Mutex<Vec<ScheduledJob>>,
    dispatched: AtomicU64,
    requeued: AtomicU64,
}

impl Shared {
    fn take_due(&self, now: DateTime<Utc>) -> Vec<WarmupJob> {
        let mut scheduled = self.scheduled.lock();
        let (mut due, pending): (Vec<_>, Vec<_>) =
            scheduled.drain(..).partition(|s| s.process_at <= now);
        *scheduled = pending;
        drop(scheduled);

        due.sort_by(|a, b| b.job.priority.cmp(&a.job.priority));
        due.into_iter().map(|s| s.job).collect()
    }

    /// Put jobs the sink turned away back in the list, due at once.
    fn requeue(&self, rejected: Vec<WarmupJob>) -> usize {
        let count = rejected.len();
        if count == 0 {
            return 0;
        }
        let now = Utc::now();
        self.scheduled
            .lock()
            .extend(rejected.into_iter().map(|job| ScheduledJob {
                job,
                process_at: now,
                scheduled_at: now,
            }));
        self.requeued.fetch_add(count as u64, Ordering::Relaxed);
        warn!(count, "sink rejected jobs, kept for the next dispatch");
        count
    }

    /// Submit jobs, keeping the rejected ones. Returns how many were accepted.
    async fn submit(&self, jobs: Vec<WarmupJob>) -> usize {
        let count = jobs.len();
        let rejected = self.sink.submit(jobs).await;
        let accepted = count - self.requeue(rejected);
        self.dispatched.fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    async fn dispatch_due(&self) -> usize {
        let due = self.take_due(Utc::now());
        if due.is_empty() {
            return 0;
        }
        let accepted = self.submit(due).await;
        debug!(accepted, "dispatched due scheduled jobs");
        accepted
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    triggers: Vec<IntervalTrigger>,
    running: Option<Running>,
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    state: Mutex<State>,
}

impl JobScheduler {
    pub fn new(sink: Arc<dyn JobSink>, check_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                check_interval,
                scheduled: Mutex::new(Vec::new()),
                dispatched: AtomicU64::new(0),
                requeued: AtomicU64::new(0),
            }),
            state: Mutex::new(State::default()),
        }
    }

    /// Register a named interval trigger. If the scheduler is running the
    /// trigger starts immediately; its first tick is one `period` away.
    pub fn add_interval_trigger(
        &self,
        name: impl Into<String>,
        period: Duration,
        health: HealthCheck,
        source: JobSource,
    ) {
        let trigger = IntervalTrigger {
            name: name.into(),
            period,
            health,
            source,
            counters: Arc::new(TriggerCounters::default()),
        };
        let mut state = self.state.lock();
        if let Some(running) = state.running.as_mut() {
            let handle = spawn_trigger(
                self.shared.clone(),
                trigger.clone(),
                running.shutdown.subscribe(),
            );
            running.handles.push(handle);
        }
        state.triggers.push(trigger);
    }

    /// Hand a job to the sink right away. A rejected job is held as due.
    pub async fn schedule_job(&self, job: WarmupJob) -> usize {
        self.schedule_jobs(vec![job]).await
    }

    pub async fn schedule_jobs(&self, jobs: Vec<WarmupJob>) -> usize {
        self.shared.submit(jobs).await
    }

    /// Hold a job until `process_at`. A time in the past makes it due at the
    /// next check.
    pub fn schedule_at(&self, job: WarmupJob, process_at: DateTime<Utc>) {
        debug!(key = %job.key, %process_at, "warmup job deferred");
        self.shared.scheduled.lock().push(ScheduledJob {
            job,
            process_at,
            scheduled_at: Utc::now(),
        });
    }

    /// Dispatch every due deferred job now, returning how many the sink accepted.
    pub async fn process_scheduled_jobs(&self) -> usize {
        self.shared.dispatch_due().await
    }

    /// Deferred jobs not yet dispatched, earliest first.
    pub fn pending_jobs(&self) -> Vec<ScheduledJob> {
        let mut pending = self.shared.scheduled.lock().clone();
        pending.sort_by_key(|s| s.process_at);
        pending
    }

    /// Remove deferred jobs for `key`, returning how many were dropped.
    pub fn cancel(&self, key: &str) -> usize {
        let mut scheduled = self.shared.scheduled.lock();
        let before = scheduled.len();
        scheduled.retain(|s| s.job.key != key);
        before - scheduled.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running.is_some()
    }

    /// Start triggers and the deferred-job check loop. No-op if running.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.running.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles: Vec<_> = state
            .triggers
            .iter()
            .map(|trigger| {
                spawn_trigger(self.shared.clone(), trigger.clone(), shutdown_rx.clone())
            })
            .collect();
        handles.push(spawn_scheduled_check(self.shared.clone(), shutdown_rx));

        info!(
            triggers = handles.len() - 1,
            check_interval_ms = self.shared.check_interval.as_millis() as u64,
            "Job scheduler started"
        );
        state.running = Some(Running {
            shutdown: shutdown_tx,
            handles,
        });
    }

    /// Cancel all timers, then flush jobs that are already due. No-op if stopped.
    pub async fn stop(&self) {
        let Some(running) = self.state.lock().running.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task panicked");
            }
        }

        let flushed = self.shared.dispatch_due().await;
        let retained = self.shared.scheduled.lock().len();
        info!(flushed, retained, "Job scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        let (running, triggers) = {
            let state = self.state.lock();
            let triggers = state
                .triggers
                .iter()
                .map(|t| TriggerStats {
                    name: t.name.clone(),
                    period_ms: t.period.as_millis() as u64,
                    runs: t.counters.runs.load(Ordering::Relaxed),
                    skipped: t.counters.skipped.load(Ordering::Relaxed),
                })
                .collect();
            (state.running.is_some(), triggers)
        };
        SchedulerStats {
            running,
            triggers,
            pending_scheduled: self.shared.scheduled.lock().len(),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            requeued: self.shared.requeued.load(Ordering::Relaxed),
        }
    }
}

fn spawn_trigger(
    shared: Arc<Shared>,
    trigger: IntervalTrigger,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + trigger.period, trigger.period);
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
                    if !(trigger.health)().await {
                        trigger.counters.skipped.fetch_add(1, Ordering::Relaxed);
                        debug!(trigger = %trigger.name, "health check failed, skipping tick");
                        continue;
                    }
                    let jobs = (trigger.source)();
                    let count = jobs.len();
                    if count > 0 {
                        // Sources rebuild their jobs every tick, so rejects are not kept.
                        let rejected = shared.sink.submit(jobs).await.len();
                        shared.dispatched.fetch_add((count - rejected) as u64, Ordering::Relaxed);
                    }
                    trigger.counters.runs.fetch_add(1, Ordering::Relaxed);
                    debug!(trigger = %trigger.name, jobs = count, "interval trigger fired");
                }
            }
        }
        debug!(trigger = %trigger.name, "interval trigger stopped");
    })
}

fn spawn_scheduled_check(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(shared.check_interval);
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
                    shared.dispatch_due().await;
                }
            }
        }
    })
}
