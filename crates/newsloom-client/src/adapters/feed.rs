//! RSS 2.0 / RSS 1.0 (RDF) / Atom adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use newsloom_core::config::{AdapterConfig, AdapterKind};
use newsloom_core::error::AppError;
use newsloom_core::models::{Article, HealthStatus, ScrapeOptions};
use newsloom_core::relevance::RelevancePolicy;
use newsloom_core::throttle::ThrottledFetcher;
use newsloom_core::traits::{FetchRequest, Fetcher, Scraper, same_host};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use url::Url;

use super::{gather, probe, throttled};
use crate::normalize::{ArticleDraft, Normalizer, parse_date};

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/rdf+xml, application/xml;q=0.9, text/xml;q=0.8";

/// The two feed dialects, told apart by the root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedDialect {
    /// `<rss>` or `<rdf:RDF>`; items are `<item>`.
    Rss,
    /// `<feed>`; items are `<entry>`.
    Atom,
}

/// Inspect the first element of `xml`.
pub fn detect_dialect(xml: &str) -> Result<FeedDialect, AppError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return match e.local_name().as_ref() {
                    b"rss" | b"RDF" => Ok(FeedDialect::Rss),
                    b"feed" => Ok(FeedDialect::Atom),
                    other => Err(AppError::ParsingError(format!(
                        "unrecognized feed root <{}>",
                        String::from_utf8_lossy(other)
                    ))),
                };
            }
            Ok(Event::Eof) => {
                return Err(AppError::ParsingError("empty feed document".into()));
            }
            Err(e) => return Err(AppError::ParsingError(format!("invalid XML: {e}"))),
            _ => {}
        }
    }
}

struct Frame {
    name: String,
    text: String,
}

#[derive(Default)]
struct ItemBuilder {
    draft: ArticleDraft,
    /// `content:encoded` / Atom `content`, used when there is no summary.
    content: String,
}

impl ItemBuilder {
    fn finish(self) -> Option<ArticleDraft> {
        let mut draft = self.draft;
        if draft.title.is_empty() && draft.url.is_empty() {
            return None;
        }
        if draft.description.is_empty() {
            draft.description = self.content;
        }
        Some(draft)
    }
}

/// Parse every item of an RSS or Atom document into drafts.
///
/// Items missing both a title and a link are skipped. Malformed XML after at
/// least one complete item yields the items read so far.
pub fn parse_feed(xml: &str) -> Result<Vec<ArticleDraft>, AppError> {
    let dialect = detect_dialect(xml)?;
    let item_tag = match dialect {
        FeedDialect::Rss => "item",
        FeedDialect::Atom => "entry",
    };

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut current: Option<ItemBuilder> = None;
    let mut drafts = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                if name == item_tag {
                    current = Some(ItemBuilder::default());
                } else if let Some(item) = current.as_mut() {
                    apply_attributes(item, &name, &e, &reader);
                }
                stack.push(Frame {
                    name,
                    text: String::new(),
                });
            }
            Ok(Event::Empty(e)) => {
                if let Some(item) = current.as_mut() {
                    apply_attributes(item, &local_name(&e), &e, &reader);
                }
            }
            Ok(Event::Text(t)) => {
                if current.is_some()
                    && let Some(top) = stack.last_mut()
                {
                    match t.unescape() {
                        Ok(text) => top.text.push_str(&text),
                        Err(_) => top.text.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if current.is_some()
                    && let Some(top) = stack.last_mut()
                {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::End(_)) => {
                let Some(frame) = stack.pop() else {
                    continue;
                };
                if frame.name == item_tag {
                    if let Some(draft) = current.take().and_then(ItemBuilder::finish) {
                        drafts.push(draft);
                    }
                    continue;
                }
                let Some(item) = current.as_mut() else {
                    continue;
                };
                let parent = stack.last().map(|f| f.name.as_str());
                let at_item_level = parent == Some(item_tag);
                assign_field(item, &frame.name, parent, at_item_level, frame.text.trim());

                // Nested markup (xhtml content, author/name) feeds its parent.
                if let Some(parent) = stack.last_mut()
                    && parent.name != item_tag
                {
                    if !parent.text.is_empty() {
                        parent.text.push(' ');
                    }
                    parent.text.push_str(&frame.text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                if drafts.is_empty() {
                    return Err(AppError::ParsingError(format!(
                        "invalid XML at byte {}: {e}",
                        reader.buffer_position()
                    )));
                }
                tracing::warn!(error = %e, items = drafts.len(), "Feed truncated by malformed XML");
                break;
            }
            _ => {}
        }
    }

    Ok(drafts)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, reader: &Reader<&[u8]>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.decode_and_unescape_value(reader.decoder()).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn apply_attributes(item: &mut ItemBuilder, name: &str, e: &BytesStart<'_>, reader: &Reader<&[u8]>) {
    let draft = &mut item.draft;
    match name {
        "link" => {
            let rel = attribute(e, reader, b"rel");
            if draft.url.is_empty()
                && rel.as_deref().is_none_or(|r| r == "alternate")
                && let Some(href) = attribute(e, reader, b"href")
            {
                draft.url = href;
            }
        }
        "category" => {
            if let Some(term) = attribute(e, reader, b"term") {
                draft.tags.push(term);
            }
        }
        "enclosure" => {
            let is_image = attribute(e, reader, b"type").is_none_or(|t| t.starts_with("image/"));
            if draft.image_url.is_none() && is_image {
                draft.image_url = attribute(e, reader, b"url");
            }
        }
        "thumbnail" | "content" => {
            if draft.image_url.is_none() {
                draft.image_url = attribute(e, reader, b"url");
            }
        }
        _ => {}
    }
}

fn assign_field(
    item: &mut ItemBuilder,
    name: &str,
    parent: Option<&str>,
    at_item_level: bool,
    text: &str,
) {
    if text.is_empty() {
        return;
    }
    let draft = &mut item.draft;
    match name {
        "title" if at_item_level && draft.title.is_empty() => draft.title = text.to_string(),
        "link" if at_item_level && draft.url.is_empty() => draft.url = text.to_string(),
        "guid" | "id" if at_item_level && draft.url.is_empty() && text.starts_with("http") => {
            draft.url = text.to_string();
        }
        "description" | "summary" if at_item_level && draft.description.is_empty() => {
            draft.description = text.to_string();
        }
        "encoded" | "content" if at_item_level && item.content.is_empty() => {
            item.content = text.to_string();
        }
        "pubDate" | "published" | "updated" | "date" if draft.published_at.is_none() => {
            draft.published_at = parse_date(text);
        }
        "creator" | "author" if at_item_level && draft.author.is_none() => {
            draft.author = Some(text.to_string());
        }
        "name" if parent == Some("author") && draft.author.is_none() => {
            draft.author = Some(text.to_string());
        }
        "category" | "subject" if at_item_level => draft.tags.push(text.to_string()),
        _ => {}
    }
}

/// Fetches one or more feed URLs of a single source.
pub struct FeedAdapter<F> {
    config: AdapterConfig,
    urls: Vec<Url>,
    fetcher: ThrottledFetcher<F>,
    normalizer: Normalizer,
}

impl<F: Fetcher> FeedAdapter<F> {
    pub fn new(
        config: AdapterConfig,
        fetcher: F,
        policy: Arc<dyn RelevancePolicy>,
    ) -> Result<Self, AppError> {
        let AdapterKind::Feed(settings) = &config.kind else {
            return Err(AppError::Config(format!(
                "adapter '{}' is a {} source, not a feed",
                config.id,
                config.kind.as_str()
            )));
        };
        let urls = settings
            .urls
            .iter()
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|e| AppError::Config(format!("invalid feed url {raw}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let Some(first) = urls.first().cloned() else {
            return Err(AppError::Config(format!(
                "feed adapter '{}' has no urls",
                config.id
            )));
        };

        Ok(Self {
            normalizer: Normalizer::new(&config, first, policy),
            fetcher: throttled(fetcher, &config),
            urls,
            config,
        })
    }

    async fn fetch_feed(&self, url: &Url, timeout: Duration) -> Result<Vec<Article>, AppError> {
        let request = FetchRequest::get(url.as_str())
            .with_header("Accept", FEED_ACCEPT)
            .with_timeout(timeout);
        let body = self.fetcher.fetch(&request).await?;
        let drafts = parse_feed(&body)?;
        Ok(self.normalizer.with_base(url.clone()).normalize_all(drafts))
    }
}

#[async_trait]
impl<F: Fetcher> Scraper for FeedAdapter<F> {
    async fn scrape(&self, options: &ScrapeOptions) -> Result<Vec<Article>, AppError> {
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let outcomes = join_all(self.urls.iter().map(|url| self.fetch_feed(url, timeout))).await;
        gather(&self.config.id, outcomes)
    }

    fn can_handle(&self, url: &str) -> bool {
        same_host(url, &self.config.urls())
    }

    async fn health_check(&self) -> HealthStatus {
        let request = FetchRequest::get(self.urls[0].as_str())
            .with_header("Accept", FEED_ACCEPT)
            .with_timeout(self.config.timeout);
        probe(self.fetcher.inner(), &request).await
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use newsloom_core::models::HealthState;
    use newsloom_core::relevance::KeywordPolicy;
    use newsloom_core::testutil::MockFetcher;

    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/"
     xmlns:content="http://purl.org/rss/1.0/modules/content/"
     xmlns:media="http://search.yahoo.com/mrss/">
  <channel>
    <title>Lab Blog</title>
    <link>https://lab.example.com/</link>
    <item>
      <title>New AI model tops the reasoning benchmark</title>
      <link>https://lab.example.com/posts/model</link>
      <description>&lt;p&gt;Researchers release an open source language model.&lt;/p&gt;</description>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
      <dc:creator>Ada</dc:creator>
      <category>LLM</category>
      <media:thumbnail url="https://lab.example.com/img/model.png"/>
    </item>
    <item>
      <title><![CDATA[Machine learning at the edge & beyond]]></title>
      <link>/posts/edge</link>
      <content:encoded><![CDATA[<p>How neural inference runs on tiny devices today.</p>]]></content:encoded>
      <enclosure url="https://lab.example.com/img/edge.jpg" type="image/jpeg" length="1"/>
    </item>
    <item>
      <description>An item with neither title nor link is skipped.</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Research Feed</title>
  <entry>
    <title>Deep learning paper on sparse attention</title>
    <link rel="replies" href="https://research.example.org/comments/1"/>
    <link href="https://research.example.org/papers/1"/>
    <id>urn:uuid:1</id>
    <published>2025-06-10T04:00:00Z</published>
    <updated>2025-06-11T04:00:00Z</updated>
    <author><name>Grace</name></author>
    <category term="research"/>
    <summary type="html">A new arxiv preprint on efficient transformer attention.</summary>
  </entry>
</feed>"#;

    const RDF: &str = r#"<?xml version="1.0"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#" xmlns="http://purl.org/rss/1.0/">
  <channel><title>arXiv</title></channel>
  <item>
    <title>Generative models for protein design</title>
    <link>https://arxiv.example.org/abs/1</link>
    <description>A study of generative AI for structural biology tasks.</description>
  </item>
</rdf:RDF>"#;

    #[test]
    fn test_detect_dialect() {
        assert_eq!(detect_dialect(RSS).unwrap(), FeedDialect::Rss);
        assert_eq!(detect_dialect(ATOM).unwrap(), FeedDialect::Atom);
        assert_eq!(detect_dialect(RDF).unwrap(), FeedDialect::Rss);

        let err = detect_dialect("<html><body>nope</body></html>").unwrap_err();
        assert!(matches!(err, AppError::ParsingError(_)));
        assert!(detect_dialect("").is_err());
    }

    #[test]
    fn test_parse_rss_items() {
        let drafts = parse_feed(RSS).unwrap();
        assert_eq!(drafts.len(), 2);

        let first = &drafts[0];
        assert_eq!(first.title, "New AI model tops the reasoning benchmark");
        assert_eq!(first.url, "https://lab.example.com/posts/model");
        assert!(first.description.starts_with("<p>Researchers"));
        assert!(first.published_at.is_some());
        assert_eq!(first.author.as_deref(), Some("Ada"));
        assert_eq!(first.tags, vec!["LLM".to_string()]);
        assert_eq!(
            first.image_url.as_deref(),
            Some("https://lab.example.com/img/model.png")
        );

        let second = &drafts[1];
        assert_eq!(second.title, "Machine learning at the edge & beyond");
        assert_eq!(second.url, "/posts/edge");
        assert!(second.description.contains("neural inference"));
        assert_eq!(
            second.image_url.as_deref(),
            Some("https://lab.example.com/img/edge.jpg")
        );
    }

    #[test]
    fn test_parse_atom_entry() {
        let drafts = parse_feed(ATOM).unwrap();
        assert_eq!(drafts.len(), 1);
        let entry = &drafts[0];
        assert_eq!(entry.url, "https://research.example.org/papers/1");
        assert_eq!(entry.author.as_deref(), Some("Grace"));
        assert_eq!(entry.tags, vec!["research".to_string()]);
        assert_eq!(
            entry.published_at.unwrap().to_rfc3339(),
            "2025-06-10T04:00:00+00:00"
        );
    }

    #[test]
    fn test_truncated_feed_keeps_complete_items() {
        let truncated = RSS.replace("</channel>\n</rss>", "<item><title>broken</foo>");
        let drafts = parse_feed(&truncated).unwrap();
        assert_eq!(drafts.len(), 2);

        let broken_early = "<rss><channel><item><title>x</nope></item></channel></rss>";
        assert!(parse_feed(broken_early).is_err());
    }

    fn adapter(fetcher: MockFetcher, urls: &[&str]) -> FeedAdapter<MockFetcher> {
        let config = AdapterConfig::feed(
            "lab",
            "Lab Blog",
            urls.iter().map(|u| u.to_string()).collect(),
        )
        .with_rate_limit(Duration::ZERO);
        FeedAdapter::new(config, fetcher, Arc::new(KeywordPolicy::default())).unwrap()
    }

    #[tokio::test]
    async fn test_scrape_normalizes_and_resolves_links() {
        let fetcher = MockFetcher::new("").route("https://lab.example.com/rss", RSS);
        let adapter = adapter(fetcher.clone(), &["https://lab.example.com/rss"]);

        let articles = adapter.scrape(&ScrapeOptions::new()).await.unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[1].url, "https://lab.example.com/posts/edge");
        assert!(articles.iter().all(|a| a.source.id == "lab"));

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.iter().any(|(k, _)| k == "Accept"));
        assert_eq!(requests[0].timeout, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_partial_success_across_urls() {
        let fetcher = MockFetcher::new("")
            .route("https://lab.example.com/rss", RSS)
            .route_status("https://lab.example.com/atom", 503);
        let adapter = adapter(
            fetcher,
            &["https://lab.example.com/rss", "https://lab.example.com/atom"],
        );
        let articles = adapter.scrape(&ScrapeOptions::new()).await.unwrap();
        assert_eq!(articles.len(), 2);
    }

    #[tokio::test]
    async fn test_all_urls_failing_returns_classified_error() {
        let fetcher = MockFetcher::new("").route_status("https://lab.example.com/rss", 404);
        let adapter = adapter(fetcher, &["https://lab.example.com/rss"]);
        let err = adapter.scrape(&ScrapeOptions::new()).await.unwrap_err();
        assert!(matches!(err, AppError::ClientError { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_parsing_error() {
        let fetcher = MockFetcher::new("<html><body>Not a feed</body></html>");
        let adapter = adapter(fetcher, &["https://lab.example.com/rss"]);
        let err = adapter.scrape(&ScrapeOptions::new()).await.unwrap_err();
        assert!(matches!(err, AppError::ParsingError(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_health_check() {
        let ok = adapter(MockFetcher::new(RSS), &["https://lab.example.com/rss"]);
        assert_eq!(ok.health_check().await.state, HealthState::Active);

        let down = adapter(
            MockFetcher::new("").route_status("https://lab.example.com/rss", 500),
            &["https://lab.example.com/rss"],
        );
        let status = down.health_check().await;
        assert_eq!(status.state, HealthState::Down);
        assert!(!status.healthy);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let config = AdapterConfig::html(
            "x",
            "X",
            "https://x.example.com",
            Default::default(),
        );
        let result = FeedAdapter::new(config, MockFetcher::new(""), Arc::new(KeywordPolicy::default()));
        assert!(result.is_err());
    }

    #[test]
    fn test_can_handle() {
        let adapter = adapter(MockFetcher::new(""), &["https://lab.example.com/rss"]);
        assert!(adapter.can_handle("https://lab.example.com/posts/1"));
        assert!(!adapter.can_handle("https://elsewhere.example.com/"));
    }
}
