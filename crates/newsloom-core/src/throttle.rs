//! Per-host request spacing for polite fetching.
//!
//! Every adapter wraps its fetcher in a [`ThrottledFetcher`] configured with
//! the adapter's `rate_limit`, so a source with several feed URLs on one
//! host never fires them back to back.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use newsloom_core::throttle::{ThrottleConfig, ThrottledFetcher};
//! # use newsloom_core::traits::{FetchRequest, Fetcher};
//! # #[derive(Clone)] struct Http;
//! # impl Fetcher for Http {
//! #     async fn fetch(&self, _: &FetchRequest) -> Result<String, newsloom_core::AppError> { todo!() }
//! # }
//! let fetcher = ThrottledFetcher::new(
//!     Http,
//!     ThrottleConfig::new(Duration::from_secs(1)).with_jitter(Duration::from_millis(250)),
//! );
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::error::AppError;
use crate::traits::{FetchRequest, Fetcher};

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Minimum gap between two requests to the same host.
    pub delay: Duration,
    /// Upper bound of uniform random jitter added to `delay`.
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn gap(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        self.delay + Duration::from_millis(jitter_ms(self.jitter.as_millis() as u64))
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// A [`Fetcher`] that spaces requests per host.
///
/// Each call reserves the next free instant for its host under a short lock
/// and sleeps outside it, so concurrent callers queue up one `delay` apart
/// and different hosts never wait on each other.
#[derive(Clone)]
pub struct ThrottledFetcher<F> {
    inner: F,
    config: ThrottleConfig,
    next_free: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<F: Fetcher> ThrottledFetcher<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            next_free: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Reserve a send time for `host` and return how long to wait for it.
    fn reserve(&self, host: &str) -> Duration {
        let now = Instant::now();
        let mut schedule = self
            .next_free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = schedule.get(host).map_or(now, |&at| at.max(now));
        schedule.insert(host.to_string(), slot + self.config.gap());
        slot - now
    }
}

impl<F: Fetcher> Fetcher for ThrottledFetcher<F> {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        if let Some(host) = host_key(&request.url) {
            let wait = self.reserve(&host);
            if !wait.is_zero() {
                tracing::debug!(host = %host, wait_ms = wait.as_millis() as u64, "Throttling request");
                tokio::time::sleep(wait).await;
            }
        }
        self.inner.fetch(request).await
    }
}

/// `scheme://host:port` for a URL, or `None` if it does not parse.
pub fn host_key(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let port = url.port_or_known_default()?;
    Some(format!("{}://{host}:{port}", url.scheme()))
}

// xorshift64 seeded from the clock; only used to spread request timing.
fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
