//! Circuit breaker guarding calls to a failing backend.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failure_count >= max_failures]----------> Open
//! Open     --[next call after timeout elapsed]--------> HalfOpen (call admitted)
//! HalfOpen --[half_open_max_calls successes]----------> Closed
//! HalfOpen --[any failure]----------------------------> Open
//! ```
//!
//! # Thread Safety
//!
//! All state lives behind one `parking_lot::Mutex` that is only held for the
//! admission decision and the outcome bookkeeping, never across the guarded
//! call. HalfOpen trial slots are reserved at admission time, so concurrent
//! callers can never exceed `half_open_max_calls` in-flight trials.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::metrics;

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Time the circuit stays open before admitting a trial call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Successful trial calls needed to close the circuit again.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_max_failures() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            timeout_ms: default_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the timeout elapses.
    Open,
    /// A bounded number of trial calls are admitted.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when the breaker refuses to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpen {
    /// Time left until a trial call would be admitted.
    pub retry_after: Duration,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_secs_ago: Option<f64>,
    pub max_failures: u32,
    pub timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub rejected_total: u64,
    pub opened_total: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    /// Trial calls admitted in the current HalfOpen window and not yet finished.
    trials_in_flight: u32,
    /// Bumped on every transition into HalfOpen so late outcomes from an
    /// earlier window cannot consume or release a slot of the current one.
    generation: u64,
    rejected_total: u64,
    opened_total: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            trials_in_flight: 0,
            generation: 0,
            rejected_total: 0,
            opened_total: 0,
        }
    }
}

/// Admission ticket for one guarded call.
///
/// Dropping it without recording an outcome (the guarded future was cancelled)
/// gives a HalfOpen trial slot back.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial_generation: Option<u64>,
    recorded: bool,
}

impl Admission<'_> {
    fn success(mut self) {
        self.recorded = true;
        self.breaker.record_success(self.trial_generation);
    }

    fn failure(mut self) {
        self.recorded = true;
        self.breaker.record_failure(self.trial_generation);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.release_trial(self.trial_generation);
        }
    }
}

/// Three-state circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker in the `Closed` state.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        };
        metrics::record_breaker_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `call` if the breaker admits it and record the outcome.
    ///
    /// Rejections surface as `E::from(CircuitOpen)` without invoking `call`.
    /// Every `Err` returned by `call` counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        let admission = self.admit()?;
        let result = call().await;
        match &result {
            Ok(_) => admission.success(),
            Err(_) => admission.failure(),
        }
        result
    }

    /// Current state, without side effects.
    ///
    /// An `Open` breaker whose timeout has elapsed still reports `Open` until
    /// the next call attempt moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns `true` if a call made now would be rejected.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !self.timeout_elapsed(&inner),
            CircuitState::HalfOpen => {
                inner.success_count + inner.trials_in_flight >= self.config.half_open_max_calls
            }
        }
    }

    /// Force the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.trials_in_flight = 0;
        drop(inner);
        metrics::record_breaker_state(&self.name, CircuitState::Closed);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_secs_ago: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
            max_failures: self.config.max_failures,
            timeout_ms: self.config.timeout_ms,
            half_open_max_calls: self.config.half_open_max_calls,
            rejected_total: inner.rejected_total,
            opened_total: inner.opened_total,
        }
    }

    fn timeout_elapsed(&self, inner: &Inner) -> bool {
        inner
            .last_failure
            .is_none_or(|at| at.elapsed() >= self.config.timeout())
    }

    fn admit(&self) -> Result<Admission<'_>, CircuitOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                trial_generation: None,
                recorded: false,
            }),
            CircuitState::Open => {
                if self.timeout_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.trials_in_flight = 1;
                    inner.generation += 1;
                    let generation = inner.generation;
                    drop(inner);

                    tracing::info!(breaker = %self.name, "circuit breaker half-open, admitting trial call");
                    metrics::record_breaker_state(&self.name, CircuitState::HalfOpen);

                    Ok(Admission {
                        breaker: self,
                        trial_generation: Some(generation),
                        recorded: false,
                    })
                } else {
                    inner.rejected_total += 1;
                    let elapsed = inner
                        .last_failure
                        .map(|at| at.elapsed())
                        .unwrap_or_default();
                    Err(CircuitOpen {
                        retry_after: self.config.timeout().saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.success_count + inner.trials_in_flight < self.config.half_open_max_calls {
                    inner.trials_in_flight += 1;
                    Ok(Admission {
                        breaker: self,
                        trial_generation: Some(inner.generation),
                        recorded: false,
                    })
                } else {
                    inner.rejected_total += 1;
                    Err(CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    fn record_success(&self, trial_generation: Option<u64>) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                if trial_generation != Some(inner.generation) {
                    return;
                }
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.trials_in_flight = 0;
                    drop(inner);

                    tracing::info!(breaker = %self.name, "circuit breaker closed");
                    metrics::record_breaker_state(&self.name, CircuitState::Closed);
                }
            }
            // Late success of a call admitted before the circuit re-opened.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial_generation: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        let opened = match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.max_failures => true,
            CircuitState::HalfOpen => trial_generation == Some(inner.generation),
            _ => false,
        };

        if opened {
            inner.state = CircuitState::Open;
            inner.success_count = 0;
            inner.trials_in_flight = 0;
            inner.opened_total += 1;
            let failures = inner.failure_count;
            drop(inner);

            tracing::warn!(
                breaker = %self.name,
                failure_count = failures,
                timeout_ms = self.config.timeout_ms,
                "circuit breaker opened"
            );
            metrics::record_breaker_state(&self.name, CircuitState::Open);
        }
    }

    fn release_trial(&self, trial_generation: Option<u64>) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && trial_generation == Some(inner.generation) {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Rejected,
        Backend,
    }

    impl From<CircuitOpen> for TestError {
        fn from(_: CircuitOpen) -> Self {
            TestError::Rejected
        }
    }

    fn breaker(max_failures: u32, timeout_ms: u64, half_open_max_calls: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                max_failures,
                timeout_ms,
                half_open_max_calls,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), TestError> {
        cb.execute(|| async { Err::<(), _>(TestError::Backend) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), TestError> {
        cb.execute(|| async { Ok::<_, TestError>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let cb = breaker(3, 10_000, 2);

        for _ in 0..2 {
            assert_eq!(fail(&cb).await, Err(TestError::Backend));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert_eq!(fail(&cb).await, Err(TestError::Backend));
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await;
        assert_eq!(result, Err(TestError::Rejected));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "rejected call must not run");
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(2, 10_000, 1);
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 1);
    }

    #[tokio::test]
    async fn test_single_failure_open_then_trial_after_timeout() {
        let cb = breaker(1, 50, 3);

        assert_eq!(fail(&cb).await, Err(TestError::Backend));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(succeed(&cb).await, Err(TestError::Rejected));

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(succeed(&cb).await, Ok(()));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_successes_close_circuit() {
        let cb = breaker(1, 20, 3);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);

        let stats = cb.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 20, 3);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(fail(&cb).await, Err(TestError::Backend));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().success_count, 0);
        assert_eq!(succeed(&cb).await, Err(TestError::Rejected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_trials_are_bounded() {
        let cb = Arc::new(breaker(1, 10, 2));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let admitted = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = cb.clone();
            let admitted = admitted.clone();
            let mut release_rx = release_rx.clone();
            handles.push(tokio::spawn(async move {
                cb.execute(|| async move {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    while !*release_rx.borrow() {
                        if release_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    Ok::<_, TestError>(())
                })
                .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 2);
        release_tx.send(true).unwrap();

        let mut rejected = 0;
        for handle in handles {
            if handle.await.unwrap() == Err(TestError::Rejected) {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 6);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_releases_slot() {
        let cb = breaker(1, 10, 1);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = cb.execute(|| async {
            std::future::pending::<()>().await;
            Ok::<_, TestError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb).await, Ok(()));
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
