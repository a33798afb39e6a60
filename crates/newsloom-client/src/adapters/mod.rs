//! Source adapters and the factory that builds them from config records.

pub mod api;
pub mod feed;
pub mod html;

use std::sync::Arc;
use std::time::{Duration, Instant};

use newsloom_core::config::{AdapterConfig, AdapterKind};
use newsloom_core::error::AppError;
use newsloom_core::models::{Article, HealthStatus};
use newsloom_core::relevance::RelevancePolicy;
use newsloom_core::throttle::{ThrottleConfig, ThrottledFetcher};
use newsloom_core::traits::{FetchRequest, Fetcher, Scraper};

pub use api::ApiAdapter;
pub use feed::FeedAdapter;
pub use html::HtmlAdapter;

/// Probes slower than this report `degraded`.
pub const SLOW_PROBE: Duration = Duration::from_secs(3);

/// Build the adapter variant matching `config.kind`.
pub fn build_adapter<F: Fetcher + 'static>(
    config: AdapterConfig,
    fetcher: F,
    policy: Arc<dyn RelevancePolicy>,
) -> Result<Arc<dyn Scraper>, AppError> {
    config.validate()?;
    let adapter: Arc<dyn Scraper> = match config.kind {
        AdapterKind::Feed(_) => Arc::new(FeedAdapter::new(config, fetcher, policy)?),
        AdapterKind::Api(_) => Arc::new(ApiAdapter::new(config, fetcher, policy)?),
        AdapterKind::Html(_) => Arc::new(HtmlAdapter::new(config, fetcher, policy)?),
    };
    Ok(adapter)
}

/// Build every adapter of a sources file. Invalid records are logged and
/// left out.
pub fn build_all<F: Fetcher + 'static>(
    configs: Vec<AdapterConfig>,
    fetcher: F,
    policy: Arc<dyn RelevancePolicy>,
) -> Vec<Arc<dyn Scraper>> {
    configs
        .into_iter()
        .filter_map(|config| {
            let id = config.id.clone();
            build_adapter(config, fetcher.clone(), Arc::clone(&policy))
                .inspect_err(|e| tracing::warn!(adapter = %id, error = %e, "Skipping adapter"))
                .ok()
        })
        .collect()
}

pub(crate) fn throttled<F: Fetcher>(fetcher: F, config: &AdapterConfig) -> ThrottledFetcher<F> {
    ThrottledFetcher::new(fetcher, ThrottleConfig::new(config.rate_limit))
}

/// Time one request and classify the outcome.
pub(crate) async fn probe<F: Fetcher>(fetcher: &F, request: &FetchRequest) -> HealthStatus {
    let started = Instant::now();
    let outcome = fetcher
        .fetch(request)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string());
    HealthStatus::from_probe(outcome, started.elapsed(), SLOW_PROBE)
}

/// Combine the outcomes of one source's requests.
///
/// Succeeds if any request succeeded; otherwise fails with the first error.
pub(crate) fn gather(
    source_id: &str,
    outcomes: Vec<Result<Vec<Article>, AppError>>,
) -> Result<Vec<Article>, AppError> {
    let mut articles = Vec::new();
    let mut first_error = None;
    let mut succeeded = false;

    for outcome in outcomes {
        match outcome {
            Ok(batch) => {
                succeeded = true;
                articles.extend(batch);
            }
            Err(e) => {
                tracing::warn!(adapter = %source_id, error = %e, "Request failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if !succeeded => Err(e),
        _ => Ok(articles),
    }
}
