use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ScrapingError;

/// Topical category of an article or a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Research,
    Industry,
    Tools,
    Policy,
    Community,
    General,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Research,
        Category::Industry,
        Category::Tools,
        Category::Policy,
        Category::Community,
        Category::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Research => "research",
            Category::Industry => "industry",
            Category::Tools => "tools",
            Category::Policy => "policy",
            Category::Community => "community",
            Category::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "research" => Ok(Category::Research),
            "industry" => Ok(Category::Industry),
            "tools" => Ok(Category::Tools),
            "policy" => Ok(Category::Policy),
            "community" => Ok(Category::Community),
            "general" => Ok(Category::General),
            _ => Err(format!("Unknown category: {s}")),
        }
    }
}

/// Where an article came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    pub category: Category,
}

/// A normalized article.
///
/// Produced by the normalization pipeline; `url` is the canonical absolute
/// URL used as the deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub source: SourceDescriptor,
    pub author: Option<String>,
    pub category: Category,
    pub tags: BTreeSet<String>,
    /// Topical fit in [0, 1].
    pub relevance: f64,
    /// Freshness in [0, 1], derived from `published_at`.
    pub recency: f64,
}

/// Scheduling hint carried by [`ScrapeOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPriority {
    /// Favor first results: failing sources are not retried.
    Speed,
    #[default]
    Quality,
}

/// Per-call scraping parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScrapeOptions {
    /// Only adapters serving at least one of these categories run. Empty means all.
    pub categories: BTreeSet<Category>,
    pub max_articles: Option<usize>,
    /// Overrides each adapter's configured timeout.
    pub timeout: Option<Duration>,
    pub priority: LoadPriority,
}

impl ScrapeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn with_max_articles(mut self, max: usize) -> Self {
        self.max_articles = Some(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: LoadPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns true if a source serving `categories` is eligible for this call.
    pub fn matches(&self, categories: &BTreeSet<Category>) -> bool {
        self.categories.is_empty() || !self.categories.is_disjoint(categories)
    }

    /// Stable key identifying logically identical calls.
    pub fn cache_key(&self) -> String {
        let categories: Vec<&str> = self.categories.iter().map(Category::as_str).collect();
        format!(
            "{}|{}|{}|{:?}",
            categories.join(","),
            self.max_articles.map(|m| m.to_string()).unwrap_or_default(),
            self.timeout.map(|t| t.as_millis().to_string()).unwrap_or_default(),
            self.priority
        )
    }
}

/// Aggregate output of one `scrape_all` run. Never mutated after it is returned.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapingResult {
    pub articles: Vec<Article>,
    /// Ids of the adapters that were contacted.
    pub sources: Vec<String>,
    pub processed_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub errors: Vec<ScrapingError>,
    pub completed_at: DateTime<Utc>,
}

impl ScrapingResult {
    /// Result of a run where no adapter was eligible.
    pub fn empty() -> Self {
        Self {
            articles: Vec::new(),
            sources: Vec::new(),
            processed_count: 0,
            success_count: 0,
            error_count: 0,
            duration: Duration::ZERO,
            errors: Vec::new(),
            completed_at: Utc::now(),
        }
    }
}

/// Operational state reported by a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Active,
    Degraded,
    Down,
    Maintenance,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Active => "active",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
            HealthState::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub state: HealthState,
    #[serde(with = "duration_ms")]
    pub response_time: Duration,
    pub last_checked: DateTime<Utc>,
    pub errors: Vec<String>,
}

impl HealthStatus {
    /// Classify a probe outcome. Slow successes count as degraded.
    pub fn from_probe(
        outcome: Result<(), String>,
        response_time: Duration,
        slow_threshold: Duration,
    ) -> Self {
        let (state, errors) = match outcome {
            Ok(()) if response_time > slow_threshold => (HealthState::Degraded, Vec::new()),
            Ok(()) => (HealthState::Active, Vec::new()),
            Err(e) => (HealthState::Down, vec![e]),
        };
        Self {
            healthy: matches!(state, HealthState::Active | HealthState::Degraded),
            state,
            response_time,
            last_checked: Utc::now(),
            errors,
        }
    }

    pub fn maintenance(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            state: HealthState::Maintenance,
            response_time: Duration::ZERO,
            last_checked: Utc::now(),
            errors: vec![reason.into()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub adapter_id: String,
    pub adapter_name: String,
    pub status: HealthStatus,
}

/// Per-adapter counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdapterStats {
    pub id: String,
    pub name: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub articles: u64,
    pub average_response_ms: f64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

impl AdapterStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

/// Snapshot of the manager's aggregate statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapingStats {
    pub total_adapters: usize,
    pub active_adapters: usize,
    pub total_runs: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_response_ms: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub adapters: Vec<AdapterStats>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Serde helper storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
