//! Incremental loading: publish partial results as sources finish.
//!
//! Adapters are taken in priority order, a few at a time. After each one
//! settles, the merged articles so far are published as a
//! [`ProgressEvent::Partial`]; the complete result follows as
//! [`ProgressEvent::Final`]. A short pause between batches gives the
//! consumer room to render.
//!
//! Cancellation is cooperative. Per-adapter calls run as detached tasks, so
//! a cancelled load stops publishing right away while in-flight fetches
//! finish in the background and are ignored.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, ScrapingError};
use crate::manager::{ScraperManager, merge_articles};
use crate::models::{Article, LoadPriority, ScrapeOptions, ScrapingResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressiveConfig {
    /// Per-adapter deadline.
    pub timeout: Duration,
    /// Adapters dispatched together.
    pub batch_size: usize,
    /// Pause between batches.
    pub pause: Duration,
    pub max_articles: usize,
    pub priority: LoadPriority,
}

impl ProgressiveConfig {
    /// Tuned for time to first result.
    pub fn quick() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            batch_size: 2,
            pause: Duration::from_millis(50),
            max_articles: 50,
            priority: LoadPriority::Speed,
        }
    }

    /// Tuned for completeness.
    pub fn quality() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            batch_size: 4,
            pause: Duration::from_millis(100),
            max_articles: 200,
            priority: LoadPriority::Quality,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self::quality()
    }
}

/// Merged view after one more source settled.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    /// The source that just settled.
    pub source_id: String,
    pub completed: usize,
    pub total: usize,
    pub articles: Vec<Article>,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Partial(ProgressUpdate),
    Final(ScrapingResult),
}

/// Consumer of progress events.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn publish(&self, event: ProgressEvent) {
        // A closed receiver just means nobody is listening any more.
        let _ = self.send(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProgressiveLoader {
    manager: Arc<ScraperManager>,
    config: ProgressiveConfig,
    current: Mutex<Option<CancellationToken>>,
    partial: Mutex<ScrapingResult>,
}

impl ProgressiveLoader {
    pub fn new(manager: Arc<ScraperManager>, config: ProgressiveConfig) -> Self {
        Self {
            manager,
            config,
            current: Mutex::new(None),
            partial: Mutex::new(ScrapingResult::empty()),
        }
    }

    pub fn quick(manager: Arc<ScraperManager>) -> Self {
        Self::new(manager, ProgressiveConfig::quick())
    }

    pub fn quality(manager: Arc<ScraperManager>) -> Self {
        Self::new(manager, ProgressiveConfig::quality())
    }

    pub fn config(&self) -> &ProgressiveConfig {
        &self.config
    }

    /// The latest partial snapshot of the current or last load.
    pub fn partial(&self) -> ScrapingResult {
        lock(&self.partial).clone()
    }

    /// Cancel the load in progress. Returns false if none was running.
    pub fn cancel(&self) -> bool {
        match lock(&self.current).take() {
            Some(token) => {
                token.cancel();
                tracing::info!("Progressive load cancelled");
                true
            }
            None => false,
        }
    }

    /// Load every eligible source, publishing partial results to `sink`.
    ///
    /// Starting a new load cancels the previous one. Returns
    /// [`AppError::Cancelled`] if this load was cancelled before finishing.
    pub async fn load(
        &self,
        options: &ScrapeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ScrapingResult, AppError> {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.current).replace(token.clone()) {
            previous.cancel();
        }

        let started = Instant::now();
        let options = ScrapeOptions {
            max_articles: Some(options.max_articles.unwrap_or(self.config.max_articles)),
            timeout: Some(options.timeout.unwrap_or(self.config.timeout)),
            priority: self.config.priority,
            ..options.clone()
        };
        let max = options.max_articles.unwrap_or(self.config.max_articles);
        let adapters = self.manager.eligible(&options);
        let total = adapters.len();
        *lock(&self.partial) = ScrapingResult::empty();

        tracing::info!(
            sources = total,
            batch_size = self.config.batch_size,
            "Progressive load started"
        );

        let mut slots: Vec<Vec<Article>> = vec![Vec::new(); total];
        let mut errors: Vec<ScrapingError> = Vec::new();
        let mut settled: Vec<String> = Vec::new();
        let mut success_count = 0;
        let mut completed = 0;
        let batch_size = self.config.batch_size.max(1);

        for (batch_index, batch) in adapters.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(AppError::Cancelled),
                    () = tokio::time::sleep(self.config.pause) => {}
                }
            }
            if token.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let mut pending: FuturesUnordered<_> = batch
                .iter()
                .enumerate()
                .map(|(offset, config)| {
                    let manager = Arc::clone(&self.manager);
                    let id = config.id.clone();
                    let call_options = options.clone();
                    let task =
                        tokio::spawn(async move { manager.scrape_adapter(&id, &call_options).await });
                    let rank = batch_index * batch_size + offset;
                    async move { (rank, task.await) }
                })
                .collect();

            loop {
                let next = tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(AppError::Cancelled),
                    next = pending.next() => next,
                };
                let Some((rank, joined)) = next else {
                    break;
                };
                // Late results of a cancelled load are dropped.
                if token.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                let config = &adapters[rank];
                let outcome = joined.unwrap_or_else(|e| {
                    Err(AppError::Unknown(format!("Scrape task failed: {e}")))
                });
                match outcome {
                    Ok(articles) => {
                        success_count += 1;
                        slots[rank] = articles;
                    }
                    Err(e) => {
                        tracing::warn!(source = %config.id, error = %e, "Source failed during progressive load");
                        errors.push(ScrapingError::new(&config.id, &config.name, &e));
                    }
                }
                completed += 1;
                settled.push(config.id.clone());

                let articles = merge_articles(slots.clone(), max);
                {
                    let mut partial = lock(&self.partial);
                    // A newer load cancels this token before resetting the snapshot.
                    if token.is_cancelled() {
                        return Err(AppError::Cancelled);
                    }
                    partial.articles = articles.clone();
                    partial.sources = settled.clone();
                    partial.processed_count = completed;
                    partial.success_count = success_count;
                    partial.error_count = errors.len();
                    partial.errors = errors.clone();
                    partial.duration = started.elapsed();
                    partial.completed_at = Utc::now();
                }
                sink.publish(ProgressEvent::Partial(ProgressUpdate {
                    source_id: config.id.clone(),
                    completed,
                    total,
                    articles,
                    errors: errors.len(),
                }));
            }
        }

        let result = ScrapingResult {
            articles: merge_articles(slots, max),
            sources: adapters.iter().map(|c| c.id.clone()).collect(),
            processed_count: total,
            success_count,
            error_count: errors.len(),
            duration: started.elapsed(),
            errors,
            completed_at: Utc::now(),
        };

        {
            let mut current = lock(&self.current);
            // A newer load cancels this token before replacing it.
            if token.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            *current = None;
            *lock(&self.partial) = result.clone();
        }
        tracing::info!(
            articles = result.articles.len(),
            failed = result.error_count,
            duration_ms = result.duration.as_millis() as u64,
            "Progressive load finished"
        );
        sink.publish(ProgressEvent::Final(result.clone()));
        Ok(result)
    }
}
