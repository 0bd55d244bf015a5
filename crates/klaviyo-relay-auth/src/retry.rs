//! Fixed-delay retry for login steps and refresh cycles.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry budget: one initial attempt plus `retries` more, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Total attempts allowed.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Failure after the retry budget ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. Every failure is retried; the
/// last error is returned with the number of attempts made.
pub async fn retry_fixed<F, Fut, T, E>(
    policy: RetryPolicy,
    step: &str,
    mut op: F,
) -> std::result::Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                tracing::error!(
                    step,
                    attempts,
                    error = %e,
                    "All attempts failed"
                );
                return Err(Exhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                tracing::warn!(
                    step,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
