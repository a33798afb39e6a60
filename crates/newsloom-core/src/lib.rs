pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod progressive;
pub mod proxy;
pub mod queue;
pub mod relevance;
pub mod retry;
pub mod throttle;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::{AdapterConfig, AdapterKind, SourcesFile};
pub use error::{AppError, ErrorKind, ScrapingError, classify};
pub use manager::{ManagerConfig, ScrapeEvent, ScrapeReporter, ScraperManager, TracingScrapeReporter};
pub use models::{
    Article, Category, HealthCheckResult, HealthState, HealthStatus, LoadPriority, ScrapeOptions,
    ScrapingResult, ScrapingStats, compute_hash,
};
pub use progressive::{ProgressEvent, ProgressSink, ProgressiveConfig, ProgressiveLoader};
pub use queue::{QueueConfig, RequestQueue};
pub use relevance::{GateMode, KeywordPolicy, RelevancePolicy};
pub use retry::{RetryPolicy, with_fallback, with_retry, with_timeout};
pub use traits::{FetchRequest, Fetcher, Scraper};
