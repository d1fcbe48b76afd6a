//! Cache and warming metrics.
//!
//! Two layers:
//! - [`CacheMetrics`]: per-instance atomic counters owned by a cache, readable
//!   as a snapshot for stats and health reports.
//! - Process-level Prometheus export via the `metrics` facade (cache hits and
//!   misses per tier, warmup jobs, breaker state, dead-lettered jobs).

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::circuit_breaker::CircuitState;

/// Process-wide Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";

    // Warming metrics
    pub const WARMUP_JOBS_TOTAL: &str = "cache_warmup_jobs_total";
    pub const WARMUP_QUEUE_DEPTH: &str = "cache_warmup_queue_depth";
    pub const DEAD_LETTER_JOBS_TOTAL: &str = "cache_dead_letter_jobs_total";

    // Breaker metrics
    pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record a failed remote tier operation.
pub fn record_cache_error(operation: &'static str) {
    counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

/// Set the number of cache entries.
pub fn set_cache_entries(tier: &str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier.to_string()).set(count as f64);
}

// =============================================================================
// Warming Metrics
// =============================================================================

/// Record the outcome of one applied warmup job.
pub fn record_warmup_job(engine: &'static str, success: bool) {
    let outcome = if success { "processed" } else { "failed" };
    counter!(names::WARMUP_JOBS_TOTAL, "engine" => engine, "outcome" => outcome).increment(1);
}

/// Set the current depth of a warming queue.
pub fn set_queue_depth(queue: &str, depth: u64) {
    gauge!(names::WARMUP_QUEUE_DEPTH, "queue" => queue.to_string()).set(depth as f64);
}

/// Record a distributed job moved to the dead-letter store.
pub fn record_dead_letter(job_type: &str) {
    counter!(names::DEAD_LETTER_JOBS_TOTAL, "type" => job_type.to_string()).increment(1);
}

/// Record a breaker state transition (0 = closed, 1 = half-open, 2 = open).
pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!(names::CIRCUIT_BREAKER_STATE, "breaker" => breaker.to_string()).set(value);
}

// =============================================================================
// Per-instance counters
// =============================================================================

/// Atomic operation counters owned by one cache instance.
#[derive(Debug)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    started_at: parking_lot::Mutex<Instant>,
}

/// Copy of [`CacheMetrics`] at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    pub deletes: u64,
    pub hit_rate: f64,
    pub uptime_secs: u64,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            started_at: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Hits over total lookups as a percentage, 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            uptime_secs: self.started_at.lock().elapsed().as_secs(),
        }
    }

    /// Zero all counters and restart the uptime clock.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        *self.started_at.lock() = Instant::now();
    }
}
