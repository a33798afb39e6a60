//! Authenticated JSON API adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use newsloom_core::config::{
    AdapterConfig, AdapterKind, ApiAuth, ApiEndpoint, ApiSettings, HttpMethod, ResponseMapping,
};
use newsloom_core::error::AppError;
use newsloom_core::models::{Article, HealthStatus, ScrapeOptions};
use newsloom_core::relevance::RelevancePolicy;
use newsloom_core::throttle::ThrottledFetcher;
use newsloom_core::traits::{FetchRequest, Fetcher, Scraper, same_host};
use serde_json::Value;
use url::Url;

use super::{gather, probe, throttled};
use crate::normalize::{ArticleDraft, Normalizer, parse_date, parse_epoch};

/// Queries configured endpoints of a JSON API.
///
/// The API key is resolved once, here. A source that declares a key but has
/// none available is built disabled: `scrape` answers [`AppError::Disabled`]
/// and health checks report maintenance.
pub struct ApiAdapter<F> {
    config: AdapterConfig,
    settings: ApiSettings,
    key: Option<String>,
    fetcher: ThrottledFetcher<F>,
    normalizer: Normalizer,
}

impl<F: Fetcher> ApiAdapter<F> {
    pub fn new(
        mut config: AdapterConfig,
        fetcher: F,
        policy: Arc<dyn RelevancePolicy>,
    ) -> Result<Self, AppError> {
        let AdapterKind::Api(settings) = &config.kind else {
            return Err(AppError::Config(format!(
                "adapter '{}' is a {} source, not an api",
                config.id,
                config.kind.as_str()
            )));
        };
        let settings = settings.clone();
        let base = Url::parse(&settings.base_url)
            .map_err(|e| AppError::Config(format!("invalid base url {}: {e}", settings.base_url)))?;

        let key = settings.resolve_key();
        let wants_key = settings.api_key.is_some() || settings.api_key_env.is_some();
        if wants_key && key.is_none() {
            tracing::warn!(
                adapter = %config.id,
                env = settings.api_key_env.as_deref().unwrap_or("-"),
                "API key not configured, disabling adapter"
            );
            config.enabled = false;
        }

        Ok(Self {
            normalizer: Normalizer::new(&config, base, policy),
            fetcher: throttled(fetcher, &config),
            settings,
            key,
            config,
        })
    }

    fn endpoints(&self) -> Vec<ApiEndpoint> {
        if self.settings.endpoints.is_empty() {
            vec![ApiEndpoint {
                path: String::new(),
                method: HttpMethod::Get,
                params: Default::default(),
            }]
        } else {
            self.settings.endpoints.clone()
        }
    }

    /// Build the request for `endpoint`, with auth attached.
    pub fn request_for(
        &self,
        endpoint: &ApiEndpoint,
        timeout: Duration,
    ) -> Result<FetchRequest, AppError> {
        let url = join_endpoint(&self.settings.base_url, &endpoint.path)?;
        let request = match endpoint.method {
            HttpMethod::Get => endpoint
                .params
                .iter()
                .fold(FetchRequest::get(url), |r, (k, v)| r.with_query(k, v)),
            HttpMethod::Post => FetchRequest::post(url, serde_json::to_value(&endpoint.params)?),
        };
        let request = request
            .with_header("Accept", "application/json")
            .with_timeout(timeout);

        Ok(match (&self.key, &self.settings.auth) {
            (None, _) => request,
            (Some(key), ApiAuth::Bearer) => request.with_header("Authorization", format!("Bearer {key}")),
            (Some(key), ApiAuth::Header { name }) => request.with_header(name.as_str(), key.as_str()),
            (Some(key), ApiAuth::Query { param }) => request.with_query(param.as_str(), key.as_str()),
        })
    }

    async fn fetch_endpoint(
        &self,
        endpoint: &ApiEndpoint,
        timeout: Duration,
    ) -> Result<Vec<Article>, AppError> {
        let request = self.request_for(endpoint, timeout)?;
        let body = self.fetcher.fetch(&request).await?;
        let drafts = extract_drafts(&body, &self.settings.mapping)?;
        Ok(self.normalizer.normalize_all(drafts))
    }
}

#[async_trait]
impl<F: Fetcher> Scraper for ApiAdapter<F> {
    async fn scrape(&self, options: &ScrapeOptions) -> Result<Vec<Article>, AppError> {
        if !self.config.enabled {
            return Err(AppError::Disabled(self.config.id.clone()));
        }
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let endpoints = self.endpoints();
        let outcomes = join_all(endpoints.iter().map(|e| self.fetch_endpoint(e, timeout))).await;
        gather(&self.config.id, outcomes)
    }

    fn can_handle(&self, url: &str) -> bool {
        same_host(url, &self.config.urls())
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.config.enabled {
            return HealthStatus::maintenance("API key not configured");
        }
        let endpoints = self.endpoints();
        match self.request_for(&endpoints[0], self.config.timeout) {
            Ok(request) => probe(self.fetcher.inner(), &request).await,
            Err(e) => HealthStatus::from_probe(Err(e.to_string()), Duration::ZERO, Duration::MAX),
        }
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }
}

/// Append `path` to `base` without dropping the base path.
fn join_endpoint(base: &str, path: &str) -> Result<String, AppError> {
    let joined = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    };
    Url::parse(&joined)
        .map(|u| u.to_string())
        .map_err(|e| AppError::Config(format!("invalid endpoint url {joined}: {e}")))
}

/// Follow a dotted path (`data.children.0.title`) through objects and arrays.
/// An empty path is the value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn string_at(value: &Value, path: &str) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map the items of an API response to drafts.
///
/// A body that is not JSON, or has no array at `mapping.items`, is a
/// parsing error. Individual items that are not objects or carry neither a
/// title nor a url are skipped.
pub fn extract_drafts(body: &str, mapping: &ResponseMapping) -> Result<Vec<ArticleDraft>, AppError> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| AppError::ParsingError(format!("invalid JSON response: {e}")))?;
    let items = lookup(&json, &mapping.items)
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::ParsingError(format!("no item array at '{}'", mapping.items)))?;

    let drafts = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let draft = draft_from(item, mapping);
            if draft.is_none() {
                tracing::debug!(index, "Skipping malformed API item");
            }
            draft
        })
        .collect();
    Ok(drafts)
}

fn draft_from(item: &Value, mapping: &ResponseMapping) -> Option<ArticleDraft> {
    if !item.is_object() {
        return None;
    }
    let title = string_at(item, &mapping.title).unwrap_or_default();
    let url = string_at(item, &mapping.url).unwrap_or_default();
    if title.is_empty() && url.is_empty() {
        return None;
    }
    let optional = |path: &Option<String>| path.as_deref().and_then(|p| string_at(item, p));
    let published_at = mapping
        .published
        .as_deref()
        .and_then(|p| lookup(item, p))
        .and_then(|v| match v {
            Value::String(s) => parse_date(s),
            Value::Number(n) => n.as_i64().and_then(parse_epoch),
            _ => None,
        });

    Some(ArticleDraft {
        title,
        description: string_at(item, &mapping.description).unwrap_or_default(),
        url,
        image_url: optional(&mapping.image),
        published_at,
        author: optional(&mapping.author),
        tags: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use newsloom_core::models::HealthState;
    use newsloom_core::relevance::KeywordPolicy;
    use newsloom_core::testutil::MockFetcher;
    use serde_json::json;

    use super::*;

    const BODY: &str = r#"{
        "status": "ok",
        "articles": [
            {
                "title": "OpenAI launches a new reasoning model",
                "description": "The language model beats prior benchmark results on math.",
                "url": "https://news.example.com/openai-model",
                "urlToImage": "https://news.example.com/img.png",
                "author": "Jane Doe",
                "publishedAt": "2025-06-10T04:00:00Z"
            },
            "not an object",
            { "description": "no title and no url" },
            {
                "title": "Robotics startup raises funding for humanoid AI",
                "description": "Investors back a robotics company building AI helpers.",
                "url": "/robots",
                "publishedAt": 1700000000
            }
        ]
    }"#;

    fn mapping() -> ResponseMapping {
        ResponseMapping {
            image: Some("urlToImage".into()),
            author: Some("author".into()),
            published: Some("publishedAt".into()),
            ..Default::default()
        }
    }

    fn settings(auth: ApiAuth, key: Option<&str>) -> ApiSettings {
        ApiSettings {
            base_url: "https://news.example.com/v2".into(),
            endpoints: vec![ApiEndpoint {
                path: "/everything".into(),
                method: HttpMethod::Get,
                params: BTreeMap::from([("q".to_string(), "ai".to_string())]),
            }],
            api_key_env: None,
            api_key: key.map(str::to_string),
            auth,
            mapping: mapping(),
        }
    }

    fn adapter(fetcher: MockFetcher, settings: ApiSettings) -> ApiAdapter<MockFetcher> {
        let config =
            AdapterConfig::api("news", "News API", settings).with_rate_limit(Duration::ZERO);
        ApiAdapter::new(config, fetcher, Arc::new(KeywordPolicy::default())).unwrap()
    }

    #[test]
    fn test_lookup_paths() {
        let value = json!({"data": {"children": [{"title": "a"}, {"title": "b"}]}});
        assert_eq!(lookup(&value, "data.children.1.title"), Some(&json!("b")));
        assert_eq!(lookup(&value, ""), Some(&value));
        assert!(lookup(&value, "data.missing").is_none());
        assert!(lookup(&value, "data.children.x").is_none());
    }

    #[test]
    fn test_extract_drafts_skips_malformed_items() {
        let drafts = extract_drafts(BODY, &mapping()).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].author.as_deref(), Some("Jane Doe"));
        assert_eq!(
            drafts[0].image_url.as_deref(),
            Some("https://news.example.com/img.png")
        );
        assert!(drafts[0].published_at.is_some());
        assert!(drafts[1].published_at.is_some());
    }

    #[test]
    fn test_extract_drafts_rejects_bad_payloads() {
        assert!(matches!(
            extract_drafts("<html>", &mapping()),
            Err(AppError::ParsingError(_))
        ));
        assert!(matches!(
            extract_drafts(r#"{"articles": {}}"#, &mapping()),
            Err(AppError::ParsingError(_))
        ));
    }

    #[test]
    fn test_join_endpoint_keeps_base_path() {
        assert_eq!(
            join_endpoint("https://api.example.com/v2", "/everything").unwrap(),
            "https://api.example.com/v2/everything"
        );
        assert_eq!(
            join_endpoint("https://api.example.com/v2/", "top").unwrap(),
            "https://api.example.com/v2/top"
        );
        assert_eq!(
            join_endpoint("https://api.example.com", "").unwrap(),
            "https://api.example.com/"
        );
    }

    #[test]
    fn test_auth_styles() {
        let timeout = Duration::from_secs(5);
        let plain = settings(ApiAuth::Bearer, None);
        let endpoint = &plain.endpoints[0];

        let bearer = adapter(MockFetcher::new(""), settings(ApiAuth::Bearer, Some("k1")));
        let req = bearer.request_for(endpoint, timeout).unwrap();
        assert!(req
            .headers
            .contains(&("Authorization".to_string(), "Bearer k1".to_string())));
        assert_eq!(req.url, "https://news.example.com/v2/everything");
        assert_eq!(req.query, vec![("q".to_string(), "ai".to_string())]);

        let header = adapter(
            MockFetcher::new(""),
            settings(ApiAuth::Header { name: "X-Api-Key".into() }, Some("k2")),
        );
        let req = header.request_for(endpoint, timeout).unwrap();
        assert!(req
            .headers
            .contains(&("X-Api-Key".to_string(), "k2".to_string())));

        let query = adapter(
            MockFetcher::new(""),
            settings(ApiAuth::Query { param: "apiKey".into() }, Some("k3")),
        );
        let req = query.request_for(endpoint, timeout).unwrap();
        assert!(req.query.contains(&("apiKey".to_string(), "k3".to_string())));
    }

    #[test]
    fn test_post_sends_params_as_json() {
        let mut s = settings(ApiAuth::Bearer, None);
        s.endpoints[0].method = HttpMethod::Post;
        let api = adapter(MockFetcher::new(""), s.clone());
        let req = api.request_for(&s.endpoints[0], Duration::from_secs(1)).unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.body, Some(json!({"q": "ai"})));
        assert!(req.query.is_empty());
    }

    #[tokio::test]
    async fn test_scrape_maps_and_normalizes() {
        let fetcher = MockFetcher::new(BODY);
        let api = adapter(fetcher.clone(), settings(ApiAuth::Bearer, Some("secret")));

        let articles = api.scrape(&ScrapeOptions::new()).await.unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[1].url, "https://news.example.com/robots");
        assert_eq!(articles[0].author.as_deref(), Some("Jane Doe"));
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_disables_adapter() {
        let mut s = settings(ApiAuth::Bearer, None);
        s.api_key_env = Some("NEWSLOOM_TEST_DEFINITELY_UNSET".into());
        let fetcher = MockFetcher::new(BODY);
        let api = adapter(fetcher.clone(), s);

        assert!(!api.config().enabled);
        let err = api.scrape(&ScrapeOptions::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Disabled(ref id) if id == "news"));
        assert_eq!(api.health_check().await.state, HealthState::Maintenance);
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_keyless_api_stays_enabled() {
        let api = adapter(MockFetcher::new(BODY), settings(ApiAuth::Bearer, None));
        assert!(api.config().enabled);
        assert_eq!(api.health_check().await.state, HealthState::Active);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retryable() {
        let fetcher = MockFetcher::new("")
            .route_status("https://news.example.com/v2/everything", 401);
        let api = adapter(fetcher, settings(ApiAuth::Bearer, Some("bad")));
        let err = api.scrape(&ScrapeOptions::new()).await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(_)));
        assert!(!err.is_retryable());
    }
}
