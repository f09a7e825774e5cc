// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-(node, operation-class) circuit breaker.
//!
//! State machine: CLOSED → OPEN when consecutive failures reach the
//! threshold or the rolling error rate within the monitoring window does;
//! OPEN → HALF_OPEN once the recovery timeout elapses (the transitioning
//! call is admitted as the first probe); HALF_OPEN → CLOSED after
//! `half_open_max_calls` consecutive successes, or back to OPEN on any
//! failure. The state lock is released before the wrapped call executes, so
//! HALF_OPEN can bound in-flight probes.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, NodeError};

/// Breaker tuning for one operation class.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Error rate within the monitoring window that opens the circuit.
    pub error_rate_threshold: f64,
    /// Width of the rolling call-history window.
    pub monitoring_window: Duration,
    /// Time spent OPEN before the next call probes HALF_OPEN.
    pub recovery_timeout: Duration,
    /// Concurrent probe budget (and required success streak) in HALF_OPEN.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            error_rate_threshold: 0.5,
            monitoring_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    state_changed_at: Instant,
    half_open_in_flight: u32,
    half_open_successes: u32,
    /// Rolling (timestamp, success) history bounded by the monitoring window.
    history: VecDeque<(Instant, bool)>,
    total_calls: u64,
    rejected_calls: u64,
    open_count: u64,
}

/// A concurrency-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Point-in-time view of a breaker for monitoring.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub recent_calls: usize,
    pub time_in_state: Duration,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub open_count: u64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                state_changed_at: Instant::now(),
                half_open_in_flight: 0,
                half_open_successes: 0,
                history: VecDeque::new(),
                total_calls: 0,
                rejected_calls: 0,
                open_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` under this breaker. The state lock is held only around
    /// admission and outcome recording, never across `f` itself.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, NodeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        self.try_acquire()?;
        let result = f().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(err) => self.on_failure(err),
        }
        result
    }

    /// Admission control. Fails with a `CircuitOpen` error when the breaker
    /// rejects the call; the error is never retryable.
    pub fn try_acquire(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.total_calls += 1;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if inner.state_changed_at.elapsed() >= self.config.recovery_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(NodeError::new(ErrorKind::CircuitOpen(self.name.clone())))
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(NodeError::new(ErrorKind::CircuitOpen(self.name.clone())))
                }
            }
        }
    }

    /// Records a successful call.
    pub fn on_success(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.history.push_back((now, true));
        Self::trim_history(&mut inner, now, self.config.monitoring_window);
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures > 0 {
                    debug!(breaker = %self.name, "success resets consecutive failures");
                    inner.consecutive_failures = 0;
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.consecutive_failures = 0;
                }
            }
            // A success finishing after the breaker re-opened is stale.
            BreakerState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn on_failure(&self, err: &NodeError) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.history.push_back((now, false));
        Self::trim_history(&mut inner, now, self.config.monitoring_window);
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                if self.should_open(&inner) {
                    warn!(
                        breaker = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        error = %err,
                        "opening circuit"
                    );
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                warn!(breaker = %self.name, error = %err, "probe failed, re-opening circuit");
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn should_open(&self, inner: &BreakerInner) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        let calls = inner.history.len();
        if calls >= self.config.failure_threshold as usize {
            let failures = inner.history.iter().filter(|(_, ok)| !ok).count();
            let error_rate = failures as f64 / calls as f64;
            if error_rate >= self.config.error_rate_threshold {
                return true;
            }
        }
        false
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.state_changed_at = Instant::now();
        match to {
            BreakerState::Open => inner.open_count += 1,
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
            }
            BreakerState::Closed => {
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                inner.history.clear();
            }
        }
        info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker state change"
        );
    }

    fn trim_history(inner: &mut BreakerInner, now: Instant, window: Duration) {
        while let Some((ts, _)) = inner.history.front() {
            if now.duration_since(*ts) > window {
                inner.history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Returns the breaker to its initial CLOSED state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        info!(breaker = %self.name, "resetting circuit breaker");
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.state_changed_at = Instant::now();
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
        inner.history.clear();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        let calls = inner.history.len();
        let failures = inner.history.iter().filter(|(_, ok)| !ok).count();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            error_rate: if calls == 0 {
                0.0
            } else {
                failures as f64 / calls as f64
            },
            recent_calls: calls,
            time_in_state: inner.state_changed_at.elapsed(),
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            open_count: inner.open_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;
    use crate::error::ErrorKind;

    fn failure() -> NodeError {
        NodeError::new(ErrorKind::ServiceUnavailable("down".into()))
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::default())
    }

    async fn fail_call(b: &CircuitBreaker) {
        let _ = b
            .execute(|| async { Err::<(), _>(failure()) })
            .await;
    }

    async fn ok_call(b: &CircuitBreaker) {
        b.execute(|| async { Ok::<_, NodeError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures() {
        let b = breaker();
        for _ in 0..5 {
            assert_eq!(b.state(), BreakerState::Closed);
            fail_call(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        // While open, calls are rejected without executing.
        let executed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let witness = Arc::clone(&executed);
        let err = b
            .execute(|| async move {
                witness.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), NodeError>(())
            })
            .await
            .unwrap_err();
        assert!(!executed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(matches!(err.kind, ErrorKind::CircuitOpen(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let b = breaker();
        for _ in 0..4 {
            fail_call(&b).await;
        }
        assert_eq!(b.snapshot().consecutive_failures, 4);
        ok_call(&b).await;
        assert_eq!(b.snapshot().consecutive_failures, 0);
        // The streak is gone, but the rolling window still counts the old
        // failures: the error-rate rule opens the circuit on the next one.
        fail_call(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn error_rate_opens_circuit() {
        let b = CircuitBreaker::new(
            "rate",
            CircuitBreakerConfig {
                failure_threshold: 4,
                ..Default::default()
            },
        );
        // Alternate success/failure: never 4 consecutive failures, but the
        // window error rate reaches 50% with >= 4 calls.
        ok_call(&b).await;
        fail_call(&b).await;
        ok_call(&b).await;
        fail_call(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_through_half_open() {
        let b = breaker();
        for _ in 0..5 {
            fail_call(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        // Before the recovery timeout the breaker still rejects.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        // Three consecutive successful probes close the circuit.
        for i in 0..3 {
            assert_ne!(b.state(), BreakerState::Closed, "probe {i}");
            ok_call(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..5 {
            fail_call(&b).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        fail_call(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
        // The open timer restarted: still rejecting shortly after.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_bounds_concurrency() {
        let b = Arc::new(breaker());
        for _ in 0..5 {
            fail_call(&b).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        // Three calls park inside the breaker; a fourth must be rejected.
        let mut waiters = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel::<()>();
            waiters.push(tx);
            let b = Arc::clone(&b);
            handles.push(tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = rx.await;
                    Ok::<_, NodeError>(())
                })
                .await
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_err());

        for tx in waiters {
            let _ = tx.send(());
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_closed() {
        let b = breaker();
        for _ in 0..5 {
            fail_call(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        ok_call(&b).await;
    }
}
