//! Test utilities: handwritten mocks of the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability so
//! tests can assert on recorded calls after handing a clone to the code
//! under test.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::AdapterConfig;
use crate::error::AppError;
use crate::manager::{ScrapeEvent, ScrapeReporter};
use crate::models::{Article, Category, HealthStatus, ScrapeOptions, SourceDescriptor, compute_hash};
use crate::progressive::{ProgressEvent, ProgressSink};
use crate::traits::{FetchRequest, Fetcher, Scraper};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with queued responses, per-URL routes and a default body.
#[derive(Clone)]
pub struct MockFetcher {
    /// Consumed first, one per call.
    queued: Arc<Mutex<VecDeque<Result<String, AppError>>>>,
    /// Matched by exact URL when the queue is empty.
    routes: Arc<Mutex<HashMap<String, Result<String, u16>>>>,
    fallback: String,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl MockFetcher {
    /// Always answers `body`.
    pub fn new(body: &str) -> Self {
        Self {
            queued: Arc::new(Mutex::new(VecDeque::new())),
            routes: Arc::new(Mutex::new(HashMap::new())),
            fallback: body.to_string(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails the first call with `error`, then answers an empty body.
    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        let fetcher = Self::new("");
        fetcher.queued.lock().unwrap().extend(responses);
        fetcher
    }

    /// Answer `body` for requests to `url`.
    pub fn route(self, url: &str, body: &str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.to_string()));
        self
    }

    /// Answer HTTP `status` for requests to `url`.
    pub fn route_status(self, url: &str, status: u16) -> Self {
        self.routes.lock().unwrap().insert(url.to_string(), Err(status));
        self
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(queued) = self.queued.lock().unwrap().pop_front() {
            return queued;
        }
        match self.routes.lock().unwrap().get(&request.url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(AppError::from_status(*status, &request.url, None)),
            None => Ok(self.fallback.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

/// Scriptable adapter.
pub struct MockScraper {
    config: AdapterConfig,
    articles: Vec<Article>,
    error: Option<ErrorFactory>,
    /// Fail only this many calls, then succeed. `None` fails every call.
    fail_times: Option<usize>,
    delay: Duration,
    health_error: Option<String>,
    health_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockScraper {
    pub fn new(id: &str, priority: u32) -> Self {
        let config = AdapterConfig::feed(id, &format!("Mock {id}"), vec![format!("https://{id}.example.com/feed")])
            .with_priority(priority)
            .with_rate_limit(Duration::ZERO);
        Self::from_config(config)
    }

    pub fn from_config(config: AdapterConfig) -> Self {
        Self {
            config,
            articles: Vec::new(),
            error: None,
            fail_times: None,
            delay: Duration::ZERO,
            health_error: None,
            health_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_articles(mut self, articles: Vec<Article>) -> Self {
        self.articles = articles;
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.config = self.config.with_category(category);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    pub fn failing(mut self, error: impl Fn() -> AppError + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(error));
        self.fail_times = None;
        self
    }

    pub fn failing_times(
        mut self,
        times: usize,
        error: impl Fn() -> AppError + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Arc::new(error));
        self.fail_times = Some(times);
        self
    }

    pub fn unhealthy(mut self, reason: &str) -> Self {
        self.health_error = Some(reason.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.config = self.config.disabled();
        self
    }

    /// Shared counter of `scrape` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Scraper for MockScraper {
    async fn scrape(&self, _options: &ScrapeOptions) -> Result<Vec<Article>, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = &self.error
            && self.fail_times.is_none_or(|times| call < times)
        {
            return Err(error());
        }
        Ok(self.articles.clone())
    }

    fn can_handle(&self, url: &str) -> bool {
        crate::traits::same_host(url, &self.config.urls())
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        let outcome = match &self.health_error {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        };
        HealthStatus::from_probe(outcome, Duration::ZERO, Duration::from_secs(1))
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Records manager events as short labels, e.g. `source_failed:b`.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ScrapeReporter for RecordingReporter {
    fn report(&self, event: ScrapeEvent<'_>) {
        let label = match event {
            ScrapeEvent::Started { adapters, .. } => format!("started:{adapters}"),
            ScrapeEvent::SourceCompleted { source_id, .. } => format!("source_completed:{source_id}"),
            ScrapeEvent::SourceFailed { error, .. } => format!("source_failed:{}", error.source_id),
            ScrapeEvent::Completed { result, .. } => {
                format!("completed:{}/{}", result.success_count, result.error_count)
            }
            ScrapeEvent::Coalesced { .. } => "coalesced".to_string(),
            ScrapeEvent::CacheHit { .. } => "cache_hit".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A valid article from `source_id` with the given relevance.
pub fn make_article(source_id: &str, url: &str, relevance: f64) -> Article {
    Article {
        id: compute_hash(url)[..16].to_string(),
        title: format!("Article at {url}"),
        description: "A sufficiently long description of a machine learning story.".to_string(),
        url: url.to_string(),
        image_url: None,
        published_at: None,
        source: SourceDescriptor {
            id: source_id.to_string(),
            name: format!("Mock {source_id}"),
            category: Category::General,
        },
        author: None,
        category: Category::General,
        tags: BTreeSet::new(),
        relevance,
        recency: 0.5,
    }
}
