//! Static per-adapter configuration.
//!
//! Sources are declared in a JSON file, one record per adapter:
//!
//! ```json
//! {
//!   "sources": [
//!     { "type": "feed", "id": "arxiv", "name": "arXiv cs.AI",
//!       "priority": 1, "categories": ["research"],
//!       "urls": ["https://export.arxiv.org/rss/cs.AI"] },
//!     { "type": "api", "id": "newsapi", "name": "NewsAPI",
//!       "base_url": "https://newsapi.org/v2", "api_key_env": "NEWSAPI_KEY",
//!       "endpoints": [{ "path": "/everything", "params": { "q": "machine learning" } }],
//!       "mapping": { "items": "articles", "url": "url", "image": "urlToImage" } }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{Category, duration_ms};

const DEFAULT_PRIORITY: u32 = 5;
const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(1000);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Immutable settings for one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub id: String,
    pub name: String,
    /// Lower is served first. The manager ranks the distinct priorities of
    /// its adapters onto queue levels; ranks beyond the queue's last level
    /// share that level.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub categories: BTreeSet<Category>,
    /// Minimum delay between two requests to the same host.
    #[serde(
        rename = "rate_limit_ms",
        with = "duration_ms",
        default = "default_rate_limit"
    )]
    pub rate_limit: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "timeout_ms", with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: AdapterKind,
}

/// Variant-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterKind {
    Feed(FeedSettings),
    Api(ApiSettings),
    Html(HtmlSettings),
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Feed(_) => "feed",
            AdapterKind::Api(_) => "api",
            AdapterKind::Html(_) => "html",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// How the API key is attached to requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "lowercase")]
pub enum ApiAuth {
    #[default]
    Bearer,
    Header {
        name: String,
    },
    Query {
        param: String,
    },
}

/// Dotted JSON paths locating article fields in an API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMapping {
    /// Path to the array of items, e.g. `"articles"` or `"data.children"`.
    pub items: String,
    #[serde(default = "default_title_path")]
    pub title: String,
    #[serde(default = "default_description_path")]
    pub description: String,
    #[serde(default = "default_url_path")]
    pub url: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
}

impl Default for ResponseMapping {
    fn default() -> Self {
        Self {
            items: "articles".to_string(),
            title: default_title_path(),
            description: default_description_path(),
            url: default_url_path(),
            image: None,
            author: None,
            published: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
    pub endpoints: Vec<ApiEndpoint>,
    /// Environment variable holding the key. Read once, at adapter construction.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Key supplied directly (takes precedence over `api_key_env`).
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub auth: ApiAuth,
    #[serde(default)]
    pub mapping: ResponseMapping,
}

impl ApiSettings {
    /// Resolve the API key from the inline value or the environment.
    pub fn resolve_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
            .filter(|key| !key.trim().is_empty())
    }
}

/// CSS selectors used by the HTML adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSet {
    pub container: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_link_selector")]
    pub link: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            container: "article".to_string(),
            title: "h2, h3".to_string(),
            description: Some("p".to_string()),
            link: default_link_selector(),
            image: Some("img".to_string()),
            author: None,
            date: Some("time".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlSettings {
    pub url: String,
    #[serde(default)]
    pub selectors: SelectorSet,
}

impl AdapterConfig {
    fn base(id: &str, name: &str, kind: AdapterKind) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            priority: DEFAULT_PRIORITY,
            categories: BTreeSet::new(),
            rate_limit: DEFAULT_RATE_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            enabled: true,
            kind,
        }
    }

    pub fn feed(id: &str, name: &str, urls: Vec<String>) -> Self {
        Self::base(id, name, AdapterKind::Feed(FeedSettings { urls }))
    }

    pub fn api(id: &str, name: &str, settings: ApiSettings) -> Self {
        Self::base(id, name, AdapterKind::Api(settings))
    }

    pub fn html(id: &str, name: &str, url: &str, selectors: SelectorSet) -> Self {
        Self::base(
            id,
            name,
            AdapterKind::Html(HtmlSettings {
                url: url.to_string(),
                selectors,
            }),
        )
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn with_rate_limit(mut self, delay: Duration) -> Self {
        self.rate_limit = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The category articles fall back to when the content gives no better hint.
    pub fn primary_category(&self) -> Category {
        self.categories
            .iter()
            .next()
            .copied()
            .unwrap_or(Category::General)
    }

    /// URLs this adapter fetches from.
    pub fn urls(&self) -> Vec<&str> {
        match &self.kind {
            AdapterKind::Feed(feed) => feed.urls.iter().map(String::as_str).collect(),
            AdapterKind::Api(api) => vec![api.base_url.as_str()],
            AdapterKind::Html(html) => vec![html.url.as_str()],
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.trim().is_empty() {
            return Err(AppError::Config("adapter id must not be empty".into()));
        }
        let invalid = |what: &str| AppError::Config(format!("adapter '{}': {what}", self.id));
        match &self.kind {
            AdapterKind::Feed(feed) if feed.urls.is_empty() => {
                return Err(invalid("feed adapter needs at least one url"));
            }
            AdapterKind::Api(api) if api.endpoints.is_empty() => {
                return Err(invalid("api adapter needs at least one endpoint"));
            }
            AdapterKind::Html(html) if html.selectors.container.trim().is_empty() => {
                return Err(invalid("html adapter needs a container selector"));
            }
            _ => {}
        }
        for url in self.urls() {
            url::Url::parse(url).map_err(|e| invalid(&format!("invalid url {url}: {e}")))?;
        }
        Ok(())
    }
}

/// The sources file: a list of adapter configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<AdapterConfig>,
}

impl SourcesFile {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read sources file {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let file: SourcesFile = serde_json::from_str(raw)?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.id.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate adapter id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn default_rate_limit() -> Duration {
    DEFAULT_RATE_LIMIT
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_enabled() -> bool {
    true
}

fn default_title_path() -> String {
    "title".to_string()
}

fn default_description_path() -> String {
    "description".to_string()
}

fn default_url_path() -> String {
    "url".to_string()
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}
