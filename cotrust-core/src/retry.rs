//! Bounded retries with exponential backoff
//!
//! `delay = min(max, base * 2^(attempt - 1))` where `attempt` is the
//! 1-indexed attempt that just failed. The delay is a pure function of the
//! attempt number, so schedules are reproducible and can be replaced in tests.

use crate::trust::error::CotResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Backoff { base_ms, max_ms }
    }

    /// Delay after failed attempt number `attempt` (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
        Duration::from_millis(exp.min(self.max_ms))
    }
}

/// How many times to try, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        RetryPolicy { attempts, backoff }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(5, Backoff::new(100, 30_000))
    }
}

/// Run `op` until it succeeds, fails terminally, or attempts run out
///
/// Only errors whose `is_transient()` is true are retried.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, what: &str, op: F) -> CotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CotResult<T>>,
{
    let backoff = policy.backoff;
    retry_async_with(policy.attempts, |n| backoff.delay_for(n), what, op).await
}

/// `retry_async` with an explicit delay function
pub async fn retry_async_with<T, F, Fut, D>(
    attempts: u32,
    delay_for: D,
    what: &str,
    mut op: F,
) -> CotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CotResult<T>>,
    D: Fn(u32) -> Duration,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, attempts, e, delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
