// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding the upstream synthesis API.
//!
//! Tracks the outcomes of recent calls in a sliding window and stops calling
//! the upstream once the failure rate crosses a threshold, giving it time to
//! recover instead of piling retries on top of an outage.
//!
//! States:
//! - Closed: Normal operation, outcomes are recorded in the window
//! - Open: Calls are refused without contacting the upstream until the
//!   cooldown has elapsed
//! - HalfOpen: A limited number of trial calls go through. Enough consecutive
//!   successes close the circuit, any failure reopens it
//!
//! Every transition happens under one mutex, so concurrent callers always see
//! a consistent window.
//!
//! Callers take a [`CircuitPermit`] with [`CircuitBreaker::allow`] and report
//! the outcome through it. A permit dropped without an outcome (the caller was
//! cancelled) records nothing and gives its half-open slot back.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Returned by [`CircuitBreaker::allow`] when the call is refused.
#[derive(Debug, Clone, Error)]
#[error("circuit '{circuit}' is open, request rejected")]
pub struct CircuitOpen {
    pub circuit: String,
    /// Time left in the cooldown, `None` while half-open trials are saturated.
    pub retry_after: Option<Duration>,
}

/// Error type for circuit-protected operations
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error(transparent)]
    Rejected(CircuitOpen),

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Failure fraction (0.0, 1.0] of the window that trips the circuit
    pub failure_threshold: f64,
    /// Number of recent outcomes considered
    pub window_size: usize,
    /// Outcomes required before the failure fraction is evaluated
    pub minimum_calls: usize,
    /// How long to stay open before allowing trial calls
    pub cooldown: Duration,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// Trial calls allowed in flight while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window_size: 10,
            minimum_calls: 10,
            cooldown: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitConfig {
    /// Failure count past which the circuit opens even before the window
    /// fills: more than `failure_threshold` of a full window can never come
    /// back under the threshold.
    fn early_trip_failures(&self) -> f64 {
        self.failure_threshold * self.window_size as f64
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// `true` = failure
    window: VecDeque<bool>,
    window_failures: usize,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every transition so permits from an earlier phase can be told
    /// apart.
    generation: u64,
}

impl BreakerState {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(window_size),
            window_failures: 0,
            opened_at: None,
            half_open_successes: 0,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.window_failures = 0;
    }

    fn push(&mut self, failed: bool, window_size: usize) {
        if self.window.len() >= window_size.max(1) {
            if let Some(true) = self.window.pop_front() {
                self.window_failures -= 1;
            }
        }
        self.window.push_back(failed);
        if failed {
            self.window_failures += 1;
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window_failures as f64 / self.window.len() as f64
        }
    }
}

/// Point-in-time view for health endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub window_len: usize,
    pub window_failures: usize,
    pub failure_rate: f64,
    /// Time left before trial calls are allowed (open only)
    pub retry_after: Option<Duration>,
    pub half_open_successes: u32,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            inner: Mutex::new(BreakerState::new(config.window_size)),
            name,
            config,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state. An open circuit whose cooldown has passed still reads
    /// `Open` until the next `allow()` moves it to half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make one call.
    pub fn allow(&self) -> Result<CircuitPermit<'_>, CircuitOpen> {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(self.permit(&inner, false)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(self.permit(&inner, true))
                } else {
                    drop(inner);
                    Err(self.reject(Some(self.config.cooldown - elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls.max(1) {
                    inner.half_open_in_flight += 1;
                    Ok(self.permit(&inner, true))
                } else {
                    drop(inner);
                    Err(self.reject(None))
                }
            }
        }
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.allow().map_err(CircuitError::Rejected)?;
        match f().await {
            Ok(result) => {
                permit.record_success();
                Ok(result)
            }
            Err(e) => {
                permit.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Operator override: close the circuit and forget the window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.clear_window();
        inner.opened_at = None;
        self.transition(&mut inner, CircuitState::Closed);
        info!(circuit = %self.name, "Circuit breaker manually reset");
    }

    /// Operator override: open the circuit now, restarting the cooldown.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner);
        warn!(circuit = %self.name, "Circuit breaker manually opened");
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let retry_after = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => Some(self.config.cooldown.saturating_sub(at.elapsed())),
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            window_len: inner.window.len(),
            window_failures: inner.window_failures,
            failure_rate: inner.failure_rate(),
            retry_after,
            half_open_successes: inner.half_open_successes,
            calls_total: self.calls_total(),
            successes: self.successes(),
            failures: self.failures(),
            rejections: self.rejections(),
        }
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Reset all metrics
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }

    fn permit(&self, inner: &BreakerState, trial: bool) -> CircuitPermit<'_> {
        CircuitPermit {
            breaker: self,
            generation: inner.generation,
            trial,
            settled: false,
        }
    }

    fn reject(&self, retry_after: Option<Duration>) -> CircuitOpen {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
        crate::metrics::record_circuit_call(&self.name, "rejected");
        CircuitOpen {
            circuit: self.name.clone(),
            retry_after,
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        if from != to {
            debug!(circuit = %self.name, %from, %to, "Circuit breaker transition");
            crate::metrics::set_circuit_state(&self.name, to as u8);
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.opened_at = Some(Instant::now());
        inner.clear_window();
        self.transition(inner, CircuitState::Open);
    }

    fn settle(&self, permit: &CircuitPermit<'_>, failed: bool) {
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_circuit_call(&self.name, "failure");
        } else {
            self.successes.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_circuit_call(&self.name, "success");
        }

        let mut inner = self.inner.lock();
        let current = permit.generation == inner.generation;

        match inner.state {
            CircuitState::Closed => {
                // Late trial outcomes from a half-open phase that already
                // closed carry no information about the new window
                if permit.trial {
                    return;
                }
                inner.push(failed, self.config.window_size);
                let len = inner.window.len();
                let failures = inner.window_failures;
                let window_full = len >= self.config.minimum_calls.max(1).min(self.config.window_size.max(1));
                let trip = failures > 0
                    && ((window_full && inner.failure_rate() >= self.config.failure_threshold)
                        || failures as f64 > self.config.early_trip_failures());
                if trip {
                    warn!(
                        circuit = %self.name,
                        failures,
                        window = len,
                        "Circuit breaker opened"
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen if permit.trial && current => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if failed {
                    warn!(circuit = %self.name, "Trial call failed, circuit breaker reopened");
                    self.open(&mut inner);
                } else {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold.max(1) {
                        info!(circuit = %self.name, "Circuit breaker closed");
                        inner.clear_window();
                        inner.opened_at = None;
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            // Stale permits while open or half-open change nothing
            _ => {}
        }
    }

    fn release(&self, permit: &CircuitPermit<'_>) {
        if !permit.trial {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && permit.generation == inner.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Permission to make one call. Report the outcome with
/// [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure); dropping it instead records
/// nothing.
#[derive(Debug)]
#[must_use = "dropping a permit records no outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this is a half-open trial call.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(&self, false);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(&self, true);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 0.5,
            window_size: 10,
            minimum_calls: 10,
            cooldown: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 3,
        }
    }

    fn succeed(cb: &CircuitBreaker) {
        cb.allow().expect("allowed").record_success();
    }

    fn fail(cb: &CircuitBreaker) {
        cb.allow().expect("allowed").record_failure();
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", config());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", config());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.successes(), 0);
        assert_eq!(cb.failures(), 1);
    }

    #[test]
    fn test_six_of_ten_failures_opens() {
        let cb = CircuitBreaker::new("test", config());
        // Interleaved so the window fills before the failure count is decisive
        for failed in [false, true, false, true, false, true, false, true, true, true] {
            match cb.allow() {
                Ok(permit) if failed => permit.record_failure(),
                Ok(permit) => permit.record_success(),
                Err(_) => {}
            }
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow().is_err());
        assert_eq!(cb.rejections(), 1);
    }

    #[test]
    fn test_half_full_window_at_threshold_opens() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..5 {
            succeed(&cb);
        }
        for _ in 0..4 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        // 10th outcome: 5/10 failures == threshold
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_early_trip_before_window_fills() {
        let cb = CircuitBreaker::new("test", config());
        succeed(&cb);
        for _ in 0..5 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_successes_keep_circuit_closed() {
        let cb = CircuitBreaker::new("test", config());
        for i in 0..100 {
            if i % 5 == 0 {
                fail(&cb);
            } else {
                succeed(&cb);
            }
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().window_len, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_cooldown() {
        let cb = CircuitBreaker::new("test", config());
        cb.force_open();
        assert!(cb.allow().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;

        let first = cb.allow().expect("trial allowed");
        assert!(first.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        first.record_success();
        succeed(&cb);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().window_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", config());
        cb.force_open();
        tokio::time::advance(Duration::from_secs(60)).await;

        succeed(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        // Cooldown restarted
        tokio::time::advance(Duration::from_secs(30)).await;
        let rejected = cb.allow().unwrap_err();
        let left = rejected.retry_after.unwrap();
        assert!(left <= Duration::from_secs(30) && left > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let cb = CircuitBreaker::new("test", config());
        cb.force_open();
        tokio::time::advance(Duration::from_secs(60)).await;

        let a = cb.allow().unwrap();
        let b = cb.allow().unwrap();
        let c = cb.allow().unwrap();
        assert!(cb.allow().is_err());

        // A dropped permit gives its slot back without recording anything
        drop(a);
        let d = cb.allow().unwrap();
        assert_eq!(cb.successes() + cb.failures(), 0);

        b.record_success();
        c.record_success();
        d.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_permit_records_nothing() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..20 {
            let _permit = cb.allow().unwrap();
        }
        let snap = cb.snapshot();
        assert_eq!(snap.window_len, 0);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_does_not_disturb_new_phase() {
        let cb = CircuitBreaker::new("test", config());
        let stale = cb.allow().unwrap();
        cb.force_open();
        tokio::time::advance(Duration::from_secs(60)).await;
        let trial = cb.allow().unwrap();

        // Closed-era failure arriving while half-open is ignored
        stale.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        trial.record_success();
        assert_eq!(cb.snapshot().half_open_successes, 1);
    }

    #[test]
    fn test_reset_closes_and_clears() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..6 {
            fail(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow().is_ok());
        assert_eq!(cb.snapshot().window_failures, 0);
    }

    #[tokio::test]
    async fn test_call_rejected_when_open() {
        let cb = CircuitBreaker::new("test", config());
        cb.force_open();

        let called = std::sync::atomic::AtomicBool::new(false);
        let result: Result<i32, CircuitError<&str>> = cb
            .call(|| async {
                called.store(true, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected(_))));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_circuit_metrics_accumulate() {
        let cb = CircuitBreaker::new("test", config());
        for _ in 0..4 {
            succeed(&cb);
        }
        assert_eq!(cb.calls_total(), 4);
        assert_eq!(cb.successes(), 4);

        cb.reset_metrics();
        assert_eq!(cb.calls_total(), 0);
        assert_eq!(cb.successes(), 0);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.rejections(), 0);
    }

    #[test]
    fn test_concurrent_outcomes_keep_window_consistent() {
        let cb = std::sync::Arc::new(CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: 1.0,
                window_size: 50,
                minimum_calls: 50,
                ..config()
            },
        ));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        if let Ok(permit) = cb.allow() {
                            if (i + t) % 3 == 0 {
                                permit.record_failure();
                            } else {
                                permit.record_success();
                            }
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.window_len, 50);
        assert!(snap.window_failures <= 50);
        assert_eq!(snap.successes + snap.failures, 4000);
    }
}
