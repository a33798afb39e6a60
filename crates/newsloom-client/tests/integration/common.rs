use std::sync::Arc;
use std::time::Duration;

use newsloom_client::ReqwestFetcher;
use newsloom_core::manager::{ManagerConfig, ScraperManager};
use newsloom_core::queue::QueueConfig;
use newsloom_core::relevance::{KeywordPolicy, RelevancePolicy};
use newsloom_core::retry::RetryPolicy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Lab</title>
  <item>
    <title>Open source LLM tops the coding benchmark</title>
    <link>/posts/llm</link>
    <description>A new language model released under an open license.</description>
    <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
  </item>
  <item>
    <title>Shared story about AI chips and GPUs</title>
    <link>https://shared.example.com/chips</link>
    <description>Hardware makers race to build faster AI accelerators.</description>
  </item>
</channel></rss>"#;

pub const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"><title>Research</title>
  <entry>
    <title>Deep learning paper on sparse attention</title>
    <link href="https://research.example.org/papers/1"/>
    <summary>A new arxiv preprint on efficient transformer attention.</summary>
  </entry>
</feed>"#;

pub const API_BODY: &str = r#"{"data": {"items": [
  {"headline": "Shared story about AI chips and GPUs",
   "teaser": "A duplicate of the feed item from another outlet.",
   "link": "https://shared.example.com/chips/"},
  {"headline": "Robotics startup raises funding for AI helpers",
   "teaser": "Investors back a robotics company building AI assistants.",
   "link": "https://news.example.com/robots"}
]}}"#;

pub const HTML_PAGE: &str = r#"<html><body>
  <div class="post">
    <h2><a href="/blog/agents">AI agents get better at planning</a></h2>
    <p>Researchers show agents that plan multi step tasks with LLMs.</p>
  </div>
</body></html>"#;

/// A fetcher allowed to reach the local mock server.
pub fn fetcher() -> ReqwestFetcher {
    ReqwestFetcher::with_timeout(Duration::from_secs(5))
        .unwrap()
        .allow_private_urls()
}

pub fn policy() -> Arc<dyn RelevancePolicy> {
    Arc::new(KeywordPolicy::default())
}

/// Manager with fast retries so failing sources settle quickly.
pub fn manager() -> Arc<ScraperManager> {
    let queue = QueueConfig::default()
        .with_min_spacing(Duration::ZERO)
        .with_retry(RetryPolicy::new(1).with_delays(Duration::from_millis(10), Duration::from_millis(20)));
    Arc::new(ScraperManager::new(ManagerConfig::default().with_queue(queue)))
}

pub async fn mount(server: &MockServer, route: &str, status: u16, body: &str, content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(status)
                .set_body_string(body)
                .insert_header("Content-Type", content_type),
        )
        .mount(server)
        .await;
}
