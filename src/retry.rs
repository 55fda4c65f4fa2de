//! Bounded exponential backoff retry wrapper.
//!
//! `examples/original_source/backend/resilience.py` pairs the circuit
//! breaker with `tenacity`-style retry (fixed attempt count, multiplicative
//! backoff). This module reproduces that policy without a retry crate,
//! since the teacher repo does its own backoff loops by hand in
//! `call_server.rs`/`ws_audio.rs` rather than pulling in `backoff`/`tenacity`.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Retryable;

const MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        (self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))).min(MAX_DELAY)
    }

    /// Retry `f` up to `max_attempts` times with exponential backoff between
    /// attempts, capped at 2s. Stops early on a non-retryable error (§4.2:
    /// never retries authentication, quota, or validation failures). Returns
    /// the last error if retries are exhausted or the error isn't retryable.
    pub async fn run<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + Retryable,
    {
        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.max_attempts || !e.is_retryable() {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(attempt, max = self.max_attempts, error = %e, delay_ms = delay.as_millis() as u64, "retrying after failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
