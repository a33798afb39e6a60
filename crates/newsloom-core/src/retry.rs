//! Retry with exponential backoff, deadlines, and fallbacks.
//!
//! Backoff for attempt `n` (0-indexed) is
//! `min(initial_delay * factor^n, max_delay)`. Only errors whose kind is
//! retryable consume an attempt; anything else is returned at once.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Delay to wait after attempt `attempt` (0-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the next attempt, honoring a server-provided hint.
    pub fn delay_for_error(&self, attempt: u32, error: &AppError) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match error.retry_after() {
            Some(hint) => hint.min(self.max_delay).max(computed),
            None => computed,
        }
    }
}

/// Run `operation` up to `max_retries + 1` times.
///
/// Non-retryable errors are returned unchanged on first sight. When every
/// attempt fails with a retryable error, the last one is returned wrapped
/// in [`AppError::RetriesExhausted`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                tracing::debug!(error = %e, kind = %e.kind(), "Non-retryable error");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_retries => {
                tracing::warn!(
                    attempts = attempt + 1,
                    error = %e,
                    "Retries exhausted"
                );
                return Err(e.into_final(attempt + 1));
            }
            Err(e) => {
                let delay = policy.delay_for_error(attempt, &e);
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Race `operation` against a timer.
///
/// On timeout the operation future is dropped, so a late result is never observed.
pub async fn with_timeout<T, Fut>(limit: Duration, operation: Fut) -> Result<T, AppError>
where
    Fut: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(limit)),
    }
}

/// Swallow any error, log it, and return `fallback` instead.
pub async fn with_fallback<T, Fut>(operation: Fut, fallback: T) -> T
where
    Fut: Future<Output = Result<T, AppError>>,
{
    match operation.await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, kind = %e.kind(), "Operation failed, using fallback");
            fallback
        }
    }
}
