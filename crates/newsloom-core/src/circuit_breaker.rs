//! Per-adapter circuit breaker.
//!
//! A source that keeps failing with transient errors is skipped for a while
//! instead of burning queue slots and retry budget on every run.
//!
//! ```text
//! CLOSED --[N failures]--> OPEN --[recovery timeout]--> HALF_OPEN
//!   ^                        ^                              |
//!   |                        +---------[failure]------------+
//!   +---------------------[M successes]---------------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive tripping failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successful probes in half-open state before the circuit closes.
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    /// Applied to the recovery timeout when the opening failure was a 429.
    pub rate_limit_backoff_multiplier: f32,
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    recovery_timeout: Duration,
}

impl BreakerState {
    fn remaining_open(&self) -> Duration {
        self.opened_at.map_or(self.recovery_timeout, |at| {
            self.recovery_timeout.saturating_sub(at.elapsed())
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    #[serde(with = "crate::models::duration_ms::option")]
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe breaker; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerState {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            last_error: None,
            recovery_timeout: config.recovery_timeout,
        };
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Current state, applying the lazy Open to HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            last_error: inner.last_error.clone(),
            time_until_half_open: (inner.state == CircuitState::Open)
                .then(|| inner.remaining_open()),
        }
    }

    /// Fails with [`AppError::CircuitOpen`] while the circuit rejects calls.
    pub fn check(&self) -> Result<(), AppError> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        if inner.state == CircuitState::Open {
            return Err(AppError::CircuitOpen {
                name: self.name.clone(),
                retry_after: inner.remaining_open(),
            });
        }
        Ok(())
    }

    /// Run `operation` unless the circuit is open, recording its outcome.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.check()?;
        let result = operation().await;
        self.record(&result);
        result
    }

    pub fn record<T>(&self, result: &Result<T, AppError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {}
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "Circuit closed after successful probe");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.last_error = None;
                    inner.recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock();
        inner.last_error = Some(error.to_string());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failures,
                        error = %error,
                        "Circuit opened"
                    );
                    self.open(&mut inner, error);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(circuit = %self.name, error = %error, "Probe failed, circuit reopened");
                inner.successes = 0;
                self.open(&mut inner, error);
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.opened_at = None;
        inner.last_error = None;
        inner.recovery_timeout = self.config.recovery_timeout;
        tracing::info!(circuit = %self.name, "Circuit manually reset");
    }

    fn open(&self, inner: &mut BreakerState, error: &AppError) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        if error.is_rate_limit() {
            let extended = inner
                .recovery_timeout
                .mul_f32(self.config.rate_limit_backoff_multiplier.max(1.0));
            inner.recovery_timeout = extended.min(self.config.max_recovery_timeout);
            tracing::info!(
                circuit = %self.name,
                recovery_secs = inner.recovery_timeout.as_secs(),
                "Extended recovery timeout after rate limit"
            );
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened) = inner.opened_at
            && opened.elapsed() >= inner.recovery_timeout
        {
            tracing::debug!(circuit = %self.name, "Circuit half-open");
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
        }
    }
}
