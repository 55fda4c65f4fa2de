//! Circuit breaker over calls to external engines.
//!
//! Three-state machine (closed/open/half-open) with a failure counter and
//! reset timeout, matching `pybreaker.CircuitBreaker`'s semantics as used in
//! `examples/original_source/backend/resilience.py`.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::BreakerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Guards a single logical upstream call (e.g. the translation engine).
pub struct CircuitBreaker {
    name: String,
    fail_max: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            fail_max,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Called before attempting a call; returns `true` if the call may
    /// proceed, transitioning Open -> HalfOpen once the reset timeout has
    /// elapsed.
    fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    info!(breaker = %self.name, "circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, "circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.fail_max {
                    warn!(breaker = %self.name, failures = inner.failure_count, "circuit breaker opened");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Run `f` through the breaker. Short-circuits with [`BreakerError::Open`]
    /// without calling `f` if the breaker is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        if !self.allow_request() {
            return Err(BreakerError::Open);
        }
        match f().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn opens_after_fail_max() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_millis(50));
        for _ in 0..2 {
            let res = breaker.call(|| async { Err::<(), _>(Boom) }).await;
            assert!(res.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let res = breaker.call(|| async { Ok::<_, Boom>(()) }).await;
        assert!(matches!(res, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn half_open_after_timeout_then_closes_on_success() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let res = breaker.call(|| async { Ok::<_, Boom>(42) }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn concurrent_failures_open_exactly_once() {
        let breaker = Arc::new(CircuitBreaker::new("test", 3, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
