//! The scraper manager: adapter registry and `scrape_all` orchestration.
//!
//! A run selects the eligible adapters, pushes each through the shared
//! [`RequestQueue`], and settles them independently: one failing source
//! becomes a [`ScrapingError`] entry while the others keep going. Results
//! are merged in adapter priority order, deduplicated by canonical URL,
//! ranked and truncated.
//!
//! Concurrent runs with the same [`ScrapeOptions`] are coalesced: the first
//! caller leads, the rest wait for its result. Each run is therefore counted
//! once in the statistics.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::config::AdapterConfig;
use crate::error::{AppError, ScrapingError};
use crate::models::{
    AdapterStats, Article, HealthCheckResult, HealthStatus, LoadPriority, ScrapeOptions,
    ScrapingResult, ScrapingStats,
};
use crate::queue::{QueueConfig, RequestContext, RequestQueue};
use crate::traits::Scraper;

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

/// Lifecycle notifications for one `scrape_all` run.
///
/// Per run the order is `Started`, then one `SourceCompleted` or
/// `SourceFailed` per adapter, then `Completed`.
#[derive(Debug, Clone)]
pub enum ScrapeEvent<'a> {
    Started {
        run_id: Uuid,
        adapters: usize,
    },
    SourceCompleted {
        run_id: Uuid,
        source_id: &'a str,
        articles: usize,
        elapsed: Duration,
    },
    SourceFailed {
        run_id: Uuid,
        error: &'a ScrapingError,
    },
    Completed {
        run_id: Uuid,
        result: &'a ScrapingResult,
    },
    /// A caller joined a run already in flight for the same options.
    Coalesced {
        key: &'a str,
    },
    CacheHit {
        key: &'a str,
    },
}

/// Receives [`ScrapeEvent`]s. The default implementation ignores them.
pub trait ScrapeReporter: Send + Sync {
    fn report(&self, event: ScrapeEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingScrapeReporter;

impl ScrapeReporter for TracingScrapeReporter {
    fn report(&self, event: ScrapeEvent<'_>) {
        match event {
            ScrapeEvent::Started { run_id, adapters } => {
                tracing::info!(%run_id, adapters, "Scrape started");
            }
            ScrapeEvent::SourceCompleted {
                run_id,
                source_id,
                articles,
                elapsed,
            } => {
                tracing::info!(
                    %run_id,
                    source = %source_id,
                    articles,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Source completed"
                );
            }
            ScrapeEvent::SourceFailed { run_id, error } => {
                tracing::warn!(
                    %run_id,
                    source = %error.source_id,
                    kind = %error.kind,
                    retryable = error.retryable,
                    error = %error.message,
                    "Source failed"
                );
            }
            ScrapeEvent::Completed { run_id, result } => {
                tracing::info!(
                    %run_id,
                    articles = result.articles.len(),
                    succeeded = result.success_count,
                    failed = result.error_count,
                    duration_ms = result.duration.as_millis() as u64,
                    "Scrape completed"
                );
            }
            ScrapeEvent::Coalesced { key } => {
                tracing::debug!(%key, "Joined in-flight scrape");
            }
            ScrapeEvent::CacheHit { key } => {
                tracing::debug!(%key, "Serving cached scrape result");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub queue: QueueConfig,
    pub circuit: CircuitBreakerConfig,
    /// Deadline for a single adapter health probe.
    pub health_timeout: Duration,
    /// Successful probes slower than this report as degraded.
    pub slow_threshold: Duration,
    /// When set, results are cached per options for this long.
    pub cache_ttl: Option<Duration>,
    /// Used when a call does not set `max_articles`.
    pub default_max_articles: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            health_timeout: Duration::from_secs(10),
            slow_threshold: Duration::from_secs(3),
            cache_ttl: None,
            default_max_articles: 100,
        }
    }
}

impl ManagerConfig {
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_default_max_articles(mut self, max: usize) -> Self {
        self.default_max_articles = max;
        self
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Entry {
    adapter: Arc<dyn Scraper>,
    breaker: CircuitBreaker,
}

impl Entry {
    fn config(&self) -> &AdapterConfig {
        self.adapter.config()
    }
}

#[derive(Default)]
struct Book {
    runs: u64,
    last_run: Option<chrono::DateTime<Utc>>,
    adapters: HashMap<String, AdapterBook>,
}

#[derive(Default)]
struct AdapterBook {
    stats: AdapterStats,
    total_ms: f64,
}

type Waiters = HashMap<String, Vec<oneshot::Sender<ScrapingResult>>>;

enum Flight<'a> {
    Leader(FlightGuard<'a>),
    Follower(oneshot::Receiver<ScrapingResult>),
}

/// Held by the leader of a coalesced run. If the leader is dropped before
/// completing, waiting followers see a closed channel and start over.
struct FlightGuard<'a> {
    waiters: &'a Mutex<Waiters>,
    key: String,
}

impl FlightGuard<'_> {
    fn complete(self, result: &ScrapingResult) {
        let waiting = lock(self.waiters).remove(&self.key).unwrap_or_default();
        for tx in waiting {
            let _ = tx.send(result.clone());
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.waiters).remove(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ScraperManager
// ---------------------------------------------------------------------------

/// Owns the adapter registry and aggregate statistics.
pub struct ScraperManager {
    config: ManagerConfig,
    queue: RequestQueue,
    registry: RwLock<HashMap<String, Entry>>,
    book: Mutex<Book>,
    waiters: Mutex<Waiters>,
    cache: Option<moka::future::Cache<String, ScrapingResult>>,
    reporter: Arc<dyn ScrapeReporter>,
}

impl Default for ScraperManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ScraperManager {
    pub fn new(config: ManagerConfig) -> Self {
        let cache = config.cache_ttl.map(|ttl| {
            moka::future::Cache::builder()
                .max_capacity(256)
                .time_to_live(ttl)
                .build()
        });
        Self {
            queue: RequestQueue::new(config.queue.clone()),
            config,
            registry: RwLock::new(HashMap::new()),
            book: Mutex::new(Book::default()),
            waiters: Mutex::new(HashMap::new()),
            cache,
            reporter: Arc::new(TracingScrapeReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ScrapeReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an adapter. Ids must be unique.
    pub fn register(&self, adapter: Arc<dyn Scraper>) -> Result<(), AppError> {
        let config = adapter.config();
        let id = config.id.clone();
        let mut registry = self.write_registry();
        if registry.contains_key(&id) {
            return Err(AppError::Config(format!("Adapter '{id}' is already registered")));
        }

        lock(&self.book).adapters.insert(
            id.clone(),
            AdapterBook {
                stats: AdapterStats {
                    id: id.clone(),
                    name: config.name.clone(),
                    ..Default::default()
                },
                total_ms: 0.0,
            },
        );
        let breaker = CircuitBreaker::new(id.clone(), self.config.circuit.clone());
        tracing::info!(
            adapter = %id,
            kind = config.kind.as_str(),
            priority = config.priority,
            enabled = config.enabled,
            "Registered adapter"
        );
        registry.insert(id, Entry { adapter, breaker });
        drop(registry);

        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        Ok(())
    }

    /// Remove an adapter and its statistics. Returns false if it was unknown.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.write_registry().remove(id).is_some();
        if removed {
            lock(&self.book).adapters.remove(id);
            if let Some(cache) = &self.cache {
                cache.invalidate_all();
            }
            tracing::info!(adapter = %id, "Unregistered adapter");
        }
        removed
    }

    pub fn adapter(&self, id: &str) -> Option<Arc<dyn Scraper>> {
        self.read_registry().get(id).map(|e| Arc::clone(&e.adapter))
    }

    /// Configs of every registered adapter, in priority order.
    pub fn adapters(&self) -> Vec<AdapterConfig> {
        self.sorted_entries()
            .iter()
            .map(|e| e.config().clone())
            .collect()
    }

    fn sorted_entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self.read_registry().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.config()
                .priority
                .cmp(&b.config().priority)
                .then_with(|| a.config().id.cmp(&b.config().id))
        });
        entries
    }

    /// Enabled adapters matching the category filter, in priority order.
    pub fn eligible(&self, options: &ScrapeOptions) -> Vec<AdapterConfig> {
        self.eligible_entries(options)
            .iter()
            .map(|e| e.config().clone())
            .collect()
    }

    fn eligible_entries(&self, options: &ScrapeOptions) -> Vec<Entry> {
        self.sorted_entries()
            .into_iter()
            .filter(|e| e.config().enabled && options.matches(&e.config().categories))
            .collect()
    }

    /// Scrape every eligible adapter and merge the results.
    ///
    /// Never fails: per-source failures are reported in
    /// [`ScrapingResult::errors`].
    pub async fn scrape_all(&self, options: &ScrapeOptions) -> ScrapingResult {
        let key = options.cache_key();
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&key).await
        {
            self.reporter.report(ScrapeEvent::CacheHit { key: &key });
            return hit;
        }

        loop {
            match self.join_or_lead(&key) {
                Flight::Follower(rx) => {
                    self.reporter.report(ScrapeEvent::Coalesced { key: &key });
                    if let Ok(result) = rx.await {
                        return result;
                    }
                }
                Flight::Leader(guard) => {
                    let result = self.run(options).await;
                    if let Some(cache) = &self.cache {
                        cache.insert(key.clone(), result.clone()).await;
                    }
                    guard.complete(&result);
                    return result;
                }
            }
        }
    }

    fn join_or_lead(&self, key: &str) -> Flight<'_> {
        let mut waiters = lock(&self.waiters);
        if let Some(queue) = waiters.get_mut(key) {
            let (tx, rx) = oneshot::channel();
            queue.push(tx);
            return Flight::Follower(rx);
        }
        waiters.insert(key.to_string(), Vec::new());
        Flight::Leader(FlightGuard {
            waiters: &self.waiters,
            key: key.to_string(),
        })
    }

    /// Drop any cached result for `options` and scrape again.
    pub async fn refresh(&self, options: &ScrapeOptions) -> ScrapingResult {
        if let Some(cache) = &self.cache {
            cache.invalidate(&options.cache_key()).await;
        }
        self.scrape_all(options).await
    }

    async fn run(&self, options: &ScrapeOptions) -> ScrapingResult {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let entries = self.eligible_entries(options);
        self.reporter.report(ScrapeEvent::Started {
            run_id,
            adapters: entries.len(),
        });

        let mut pending: FuturesUnordered<_> = entries
            .iter()
            .enumerate()
            .map(|(rank, entry)| async move {
                let began = Instant::now();
                let outcome = self.scrape_entry(entry, options).await;
                (rank, outcome, began.elapsed())
            })
            .collect();

        let mut batches: Vec<Vec<Article>> = vec![Vec::new(); entries.len()];
        let mut errors = Vec::new();
        let mut success_count = 0;

        while let Some((rank, outcome, elapsed)) = pending.next().await {
            let config = entries[rank].config();
            match outcome {
                Ok(articles) => {
                    success_count += 1;
                    self.reporter.report(ScrapeEvent::SourceCompleted {
                        run_id,
                        source_id: &config.id,
                        articles: articles.len(),
                        elapsed,
                    });
                    batches[rank] = articles;
                }
                Err(e) => {
                    let error = ScrapingError::new(&config.id, &config.name, &e);
                    self.reporter.report(ScrapeEvent::SourceFailed {
                        run_id,
                        error: &error,
                    });
                    errors.push(error);
                }
            }
        }
        drop(pending);

        let max = options
            .max_articles
            .unwrap_or(self.config.default_max_articles);
        let result = ScrapingResult {
            articles: merge_articles(batches, max),
            sources: entries.iter().map(|e| e.config().id.clone()).collect(),
            processed_count: entries.len(),
            success_count,
            error_count: errors.len(),
            duration: started.elapsed(),
            errors,
            completed_at: Utc::now(),
        };

        {
            let mut book = lock(&self.book);
            book.runs += 1;
            book.last_run = Some(result.completed_at);
        }
        self.reporter.report(ScrapeEvent::Completed {
            run_id,
            result: &result,
        });
        result
    }

    /// Scrape a single adapter through the queue, outside any run.
    pub async fn scrape_adapter(
        &self,
        id: &str,
        options: &ScrapeOptions,
    ) -> Result<Vec<Article>, AppError> {
        let entry = self
            .read_registry()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::Config(format!("Unknown adapter '{id}'")))?;
        if !entry.config().enabled {
            return Err(AppError::Disabled(id.to_string()));
        }
        self.scrape_entry(&entry, options).await
    }

    async fn scrape_entry(
        &self,
        entry: &Entry,
        options: &ScrapeOptions,
    ) -> Result<Vec<Article>, AppError> {
        entry.breaker.check()?;

        let config = entry.config();
        let mut context = RequestContext::for_source(&config.id)
            .with_timeout(options.timeout.unwrap_or(config.timeout));
        context.max_retries = Some(match options.priority {
            LoadPriority::Speed => 0,
            LoadPriority::Quality => config.max_retries,
        });

        let adapter = &entry.adapter;
        // Start of the last attempt; queue wait and backoff are excluded.
        let last_attempt = Mutex::new(None);
        let timer = &last_attempt;
        let result = self
            .queue
            .enqueue(
                move || {
                    *lock(timer) = Some(tokio::time::Instant::now());
                    adapter.scrape(options)
                },
                self.queue_level(config.priority),
                context,
            )
            .await;

        entry.breaker.record(&result);
        let elapsed = lock(&last_attempt)
            .map(|began| began.elapsed())
            .unwrap_or_default();
        self.record(&config.id, &result, elapsed);
        result
    }

    /// Rank of `priority` among the distinct priorities of registered
    /// adapters. The queue clamps ranks past its last level.
    fn queue_level(&self, priority: u32) -> usize {
        self.read_registry()
            .values()
            .map(|entry| entry.config().priority)
            .filter(|p| *p < priority)
            .collect::<HashSet<_>>()
            .len()
    }

    fn record(&self, id: &str, result: &Result<Vec<Article>, AppError>, elapsed: Duration) {
        let mut book = lock(&self.book);
        let Some(adapter) = book.adapters.get_mut(id) else {
            return;
        };
        let stats = &mut adapter.stats;
        stats.requests += 1;
        adapter.total_ms += elapsed.as_secs_f64() * 1000.0;
        stats.average_response_ms = adapter.total_ms / stats.requests as f64;
        match result {
            Ok(articles) => {
                stats.successes += 1;
                stats.articles += articles.len() as u64;
                stats.last_success = Some(Utc::now());
            }
            Err(e) => {
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }

    /// Probe every adapter in parallel. Probe failures are reported per adapter.
    pub async fn health_check_all(&self) -> Vec<HealthCheckResult> {
        let entries = self.sorted_entries();
        let probes = entries.iter().map(|entry| async move {
            let config = entry.config();
            let status = if !config.enabled {
                HealthStatus::maintenance("Adapter is disabled")
            } else {
                match tokio::time::timeout(self.config.health_timeout, entry.adapter.health_check())
                    .await
                {
                    Ok(status) => status,
                    Err(_) => HealthStatus::from_probe(
                        Err(format!(
                            "Health check timed out after {}ms",
                            self.config.health_timeout.as_millis()
                        )),
                        self.config.health_timeout,
                        self.config.slow_threshold,
                    ),
                }
            };
            tracing::debug!(adapter = %config.id, state = %status.state, "Health probe finished");
            HealthCheckResult {
                adapter_id: config.id.clone(),
                adapter_name: config.name.clone(),
                status,
            }
        });
        futures::future::join_all(probes).await
    }

    /// Read-only snapshot of the aggregate statistics.
    pub fn get_stats(&self) -> ScrapingStats {
        let entries = self.sorted_entries();
        let book = lock(&self.book);

        let adapters: Vec<AdapterStats> = entries
            .iter()
            .filter_map(|e| book.adapters.get(&e.config().id))
            .map(|a| a.stats.clone())
            .collect();
        let total_requests: u64 = adapters.iter().map(|a| a.requests).sum();
        let successful_requests: u64 = adapters.iter().map(|a| a.successes).sum();
        let total_ms: f64 = book.adapters.values().map(|a| a.total_ms).sum();

        ScrapingStats {
            total_adapters: entries.len(),
            active_adapters: entries.iter().filter(|e| e.config().enabled).count(),
            total_runs: book.runs,
            total_requests,
            successful_requests,
            failed_requests: total_requests - successful_requests,
            success_rate: ratio(successful_requests as f64, total_requests as f64),
            average_response_ms: ratio(total_ms, total_requests as f64),
            last_run: book.last_run,
            adapters,
        }
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.sorted_entries()
            .iter()
            .map(|e| e.breaker.stats())
            .collect()
    }

    /// Re-run `options` every `interval` until `cancel` fires.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        options: ScrapeOptions,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = interval.as_millis() as u64, "Background refresh started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = manager.refresh(&options) => {
                        tracing::debug!(
                            articles = result.articles.len(),
                            errors = result.error_count,
                            "Background refresh finished"
                        );
                    }
                }
            }
            tracing::info!("Background refresh stopped");
        })
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Key used to detect the same article served by several sources.
pub fn canonical_url(raw: &str) -> String {
    match url::Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            let mut s = url.to_string();
            if s.ends_with('/') && url.path() != "/" {
                s.pop();
            }
            s
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// Merge per-adapter batches given in adapter priority order.
///
/// The first occurrence of a canonical URL wins. The rest are ranked by
/// relevance, then recency, both descending, and truncated to `max`.
pub fn merge_articles(batches: Vec<Vec<Article>>, max: usize) -> Vec<Article> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Article> = batches
        .into_iter()
        .flatten()
        .filter(|a| seen.insert(canonical_url(&a.url)))
        .collect();
    merged.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then_with(|| b.recency.total_cmp(&a.recency))
            .then_with(|| b.published_at.cmp(&a.published_at))
    });
    merged.truncate(max);
    merged
}
