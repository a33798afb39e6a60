use std::collections::HashSet;
use std::time::Duration;

use newsloom_client::build_adapter;
use newsloom_core::config::{
    AdapterConfig, ApiAuth, ApiEndpoint, ApiSettings, HttpMethod, ResponseMapping, SelectorSet,
};
use newsloom_core::error::ErrorKind;
use newsloom_core::models::{Category, HealthState, ScrapeOptions};
use newsloom_core::progressive::{ProgressEvent, ProgressiveConfig, ProgressiveLoader};
use newsloom_core::testutil::RecordingSink;
use wiremock::MockServer;

use crate::integration::common::{
    API_BODY, ATOM, HTML_PAGE, RSS, fetcher, manager, mount, policy,
};

async fn sources(server: &MockServer) -> Vec<AdapterConfig> {
    mount(server, "/rss", 200, RSS, "application/rss+xml").await;
    mount(server, "/atom", 200, ATOM, "application/atom+xml").await;
    mount(server, "/api/v1/latest", 200, API_BODY, "application/json").await;
    mount(server, "/blog", 200, HTML_PAGE, "text/html").await;
    mount(server, "/down", 500, "oops", "text/plain").await;

    let uri = server.uri();
    let api = ApiSettings {
        base_url: format!("{uri}/api/v1"),
        endpoints: vec![ApiEndpoint {
            path: "/latest".into(),
            method: HttpMethod::Get,
            params: Default::default(),
        }],
        api_key_env: None,
        api_key: Some("token".into()),
        auth: ApiAuth::Bearer,
        mapping: ResponseMapping {
            items: "data.items".into(),
            title: "headline".into(),
            description: "teaser".into(),
            url: "link".into(),
            ..Default::default()
        },
    };
    let selectors = SelectorSet {
        container: ".post".into(),
        title: "h2".into(),
        ..SelectorSet::default()
    };
    let fast = |c: AdapterConfig| c.with_rate_limit(Duration::ZERO);

    vec![
        fast(AdapterConfig::feed("lab", "Lab", vec![format!("{uri}/rss")]).with_priority(1)),
        fast(
            AdapterConfig::feed("research", "Research", vec![format!("{uri}/atom")])
                .with_priority(2)
                .with_category(Category::Research),
        ),
        fast(AdapterConfig::api("news", "News", api).with_priority(3)),
        fast(AdapterConfig::html("blog", "Blog", &format!("{uri}/blog"), selectors).with_priority(4)),
        fast(AdapterConfig::feed("down", "Down", vec![format!("{uri}/down")]).with_priority(5)),
    ]
}

#[tokio::test]
async fn scrape_all_merges_every_variant() {
    let server = MockServer::start().await;
    let manager = manager();
    for config in sources(&server).await {
        manager
            .register(build_adapter(config, fetcher(), policy()).unwrap())
            .unwrap();
    }

    let result = manager.scrape_all(&ScrapeOptions::new()).await;

    assert_eq!(result.processed_count, 5);
    assert_eq!(result.success_count, 4);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.errors[0].source_id, "down");
    assert_eq!(result.errors[0].kind, ErrorKind::Server);

    // rss(2) + atom(1) + api(2) + html(1), with the shared story counted once.
    assert_eq!(result.articles.len(), 5);
    let urls: HashSet<&str> = result.articles.iter().map(|a| a.url.as_str()).collect();
    assert_eq!(urls.len(), 5);
    assert!(urls.contains(format!("{}/posts/llm", server.uri()).as_str()));
    assert!(urls.contains(format!("{}/blog/agents", server.uri()).as_str()));

    // The feed is served first, so its copy of the shared story wins.
    let shared = result
        .articles
        .iter()
        .find(|a| a.url == "https://shared.example.com/chips")
        .unwrap();
    assert_eq!(shared.source.id, "lab");

    let research = result
        .articles
        .iter()
        .find(|a| a.source.id == "research")
        .unwrap();
    assert_eq!(research.category, Category::Research);

    for pair in result.articles.windows(2) {
        assert!(pair[0].relevance >= pair[1].relevance);
    }
}

#[tokio::test]
async fn category_filter_limits_sources() {
    let server = MockServer::start().await;
    let manager = manager();
    for config in sources(&server).await {
        manager
            .register(build_adapter(config, fetcher(), policy()).unwrap())
            .unwrap();
    }

    let options = ScrapeOptions::new().with_category(Category::Research);
    let result = manager.scrape_all(&options).await;
    assert_eq!(result.processed_count, 1);
    assert_eq!(result.sources, vec!["research".to_string()]);
}

#[tokio::test]
async fn health_checks_report_per_source() {
    let server = MockServer::start().await;
    let manager = manager();
    for config in sources(&server).await {
        manager
            .register(build_adapter(config, fetcher(), policy()).unwrap())
            .unwrap();
    }

    let results = manager.health_check_all().await;
    assert_eq!(results.len(), 5);
    for result in &results {
        let expected = if result.adapter_id == "down" {
            HealthState::Down
        } else {
            HealthState::Active
        };
        assert_eq!(result.status.state, expected, "{}", result.adapter_id);
    }
}

#[tokio::test]
async fn progressive_load_streams_batches() {
    let server = MockServer::start().await;
    let manager = manager();
    for config in sources(&server).await {
        manager
            .register(build_adapter(config, fetcher(), policy()).unwrap())
            .unwrap();
    }

    let loader = ProgressiveLoader::new(
        manager,
        ProgressiveConfig::quick().with_pause(Duration::from_millis(1)),
    );
    let sink = RecordingSink::default();
    let result = loader.load(&ScrapeOptions::new(), &sink).await.unwrap();

    assert_eq!(result.success_count, 4);
    assert_eq!(result.error_count, 1);

    let events = sink.events();
    let partials = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Partial(_)))
        .count();
    assert_eq!(partials, 5);
    assert!(matches!(events.last(), Some(ProgressEvent::Final(_))));
}
