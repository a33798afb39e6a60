use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AdapterConfig, HttpMethod};
use crate::error::AppError;
use crate::models::{Article, HealthStatus, ScrapeOptions};

/// A single outgoing HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// Plain GET, as used for feeds and HTML pages.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Fetches a response body for a request.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// The adapter contract every source variant implements.
///
/// Object-safe so the manager can hold heterogeneous adapters in one registry.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Fetch, parse and normalize this source's articles.
    async fn scrape(&self, options: &ScrapeOptions) -> Result<Vec<Article>, AppError>;

    /// Returns true if `url` belongs to this source.
    fn can_handle(&self, url: &str) -> bool;

    /// Probe the source. Never fails; failures are reported in the status.
    async fn health_check(&self) -> HealthStatus;

    fn config(&self) -> &AdapterConfig;
}

/// Returns true if `url` shares a host with any of `known`.
pub fn same_host(url: &str, known: &[&str]) -> bool {
    let Some(host) = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
    else {
        return false;
    };
    known.iter().any(|k| {
        url::Url::parse(k)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .is_some_and(|h| h == host)
    })
}
