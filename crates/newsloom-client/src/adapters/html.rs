//! Selector-driven HTML page adapter.

use std::sync::Arc;

use async_trait::async_trait;
use newsloom_core::config::{AdapterConfig, AdapterKind, SelectorSet};
use newsloom_core::error::AppError;
use newsloom_core::models::{Article, HealthStatus, ScrapeOptions};
use newsloom_core::relevance::RelevancePolicy;
use newsloom_core::throttle::ThrottledFetcher;
use newsloom_core::traits::{FetchRequest, Fetcher, Scraper, same_host};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::{probe, throttled};
use crate::normalize::{ArticleDraft, Normalizer, parse_date};

const GENERIC_CONTAINER: &str = "article, .post, .entry, .story";
const HEADLINE_LINKS: &str = "h2 a[href], h3 a[href]";

fn parse_selector(raw: &str) -> Result<Selector, AppError> {
    Selector::parse(raw).map_err(|e| AppError::Config(format!("invalid CSS selector '{raw}': {e}")))
}

fn parse_optional(raw: &Option<String>) -> Result<Option<Selector>, AppError> {
    raw.as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_selector)
        .transpose()
}

/// A [`SelectorSet`] compiled once at construction.
#[derive(Debug)]
struct CompiledSelectors {
    container: Selector,
    title: Selector,
    description: Option<Selector>,
    link: Selector,
    image: Option<Selector>,
    author: Option<Selector>,
    date: Option<Selector>,
}

impl CompiledSelectors {
    fn compile(set: &SelectorSet) -> Result<Self, AppError> {
        Ok(Self {
            container: parse_selector(&set.container)?,
            title: parse_selector(&set.title)?,
            description: parse_optional(&set.description)?,
            link: parse_selector(&set.link)?,
            image: parse_optional(&set.image)?,
            author: parse_optional(&set.author)?,
            date: parse_optional(&set.date)?,
        })
    }

    fn extract(&self, document: &Html) -> Vec<ArticleDraft> {
        document
            .select(&self.container)
            .filter_map(|block| self.draft_from(block))
            .collect()
    }

    fn draft_from(&self, block: ElementRef<'_>) -> Option<ArticleDraft> {
        let title_el = block.select(&self.title).next();
        let link_el = block.select(&self.link).next();

        let title = title_el
            .or(link_el)
            .map(element_text)
            .unwrap_or_default();
        let url = link_el
            .and_then(|a| a.value().attr("href"))
            .unwrap_or_default()
            .to_string();
        if title.is_empty() && url.is_empty() {
            return None;
        }

        let first = |selector: &Option<Selector>| {
            selector.as_ref().and_then(|s| block.select(s).next())
        };

        Some(ArticleDraft {
            title,
            description: first(&self.description)
                .map(element_text)
                .unwrap_or_default(),
            url,
            image_url: first(&self.image).and_then(image_source),
            published_at: first(&self.date).and_then(|el| {
                el.value()
                    .attr("datetime")
                    .and_then(parse_date)
                    .or_else(|| parse_date(&element_text(el)))
            }),
            author: first(&self.author)
                .map(element_text)
                .filter(|a| !a.is_empty()),
            tags: Vec::new(),
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn image_source(el: ElementRef<'_>) -> Option<String> {
    let value = el.value();
    value
        .attr("src")
        .or_else(|| value.attr("data-src"))
        .map(str::to_string)
}

/// Extraction strategies, tried in order until one yields records.
struct Extractor {
    configured: CompiledSelectors,
    generic: CompiledSelectors,
    headlines: Selector,
}

impl Extractor {
    fn new(selectors: &SelectorSet) -> Result<Self, AppError> {
        let generic = SelectorSet {
            container: GENERIC_CONTAINER.to_string(),
            ..SelectorSet::default()
        };
        Ok(Self {
            configured: CompiledSelectors::compile(selectors)?,
            generic: CompiledSelectors::compile(&generic)?,
            headlines: parse_selector(HEADLINE_LINKS)?,
        })
    }

    fn extract(&self, page: &str) -> Vec<ArticleDraft> {
        let document = Html::parse_document(page);

        let drafts = self.configured.extract(&document);
        if !drafts.is_empty() {
            return drafts;
        }
        let drafts = self.generic.extract(&document);
        if !drafts.is_empty() {
            tracing::debug!(count = drafts.len(), "Configured selectors matched nothing, used generic containers");
            return drafts;
        }
        let drafts = self.headline_links(&document);
        tracing::debug!(count = drafts.len(), "Fell back to headline links");
        drafts
    }

    /// Each `h2`/`h3` link is a record; the element after the heading is
    /// its description.
    fn headline_links(&self, document: &Html) -> Vec<ArticleDraft> {
        document
            .select(&self.headlines)
            .filter_map(|a| {
                let url = a.value().attr("href")?.to_string();
                let heading = a
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .find(|el| matches!(el.value().name(), "h2" | "h3"))?;
                let description = heading
                    .next_siblings()
                    .filter_map(ElementRef::wrap)
                    .next()
                    .map(element_text)
                    .unwrap_or_default();
                Some(ArticleDraft {
                    title: element_text(a),
                    description,
                    url,
                    ..Default::default()
                })
            })
            .collect()
    }
}

/// Scrapes a listing page with CSS selectors.
pub struct HtmlAdapter<F> {
    config: AdapterConfig,
    url: Url,
    extractor: Extractor,
    fetcher: ThrottledFetcher<F>,
    normalizer: Normalizer,
}

impl<F: Fetcher> HtmlAdapter<F> {
    /// Fails if the config is not an HTML source or a selector does not compile.
    pub fn new(
        config: AdapterConfig,
        fetcher: F,
        policy: Arc<dyn RelevancePolicy>,
    ) -> Result<Self, AppError> {
        let AdapterKind::Html(settings) = &config.kind else {
            return Err(AppError::Config(format!(
                "adapter '{}' is a {} source, not html",
                config.id,
                config.kind.as_str()
            )));
        };
        let url = Url::parse(&settings.url)
            .map_err(|e| AppError::Config(format!("invalid page url {}: {e}", settings.url)))?;
        let extractor = Extractor::new(&settings.selectors)?;

        Ok(Self {
            normalizer: Normalizer::new(&config, url.clone(), policy),
            fetcher: throttled(fetcher, &config),
            url,
            extractor,
            config,
        })
    }

    fn request(&self, options: &ScrapeOptions) -> FetchRequest {
        FetchRequest::get(self.url.as_str())
            .with_header("Accept", "text/html,application/xhtml+xml")
            .with_timeout(options.timeout.unwrap_or(self.config.timeout))
    }
}

#[async_trait]
impl<F: Fetcher> Scraper for HtmlAdapter<F> {
    async fn scrape(&self, options: &ScrapeOptions) -> Result<Vec<Article>, AppError> {
        let page = self.fetcher.fetch(&self.request(options)).await?;
        let drafts = self.extractor.extract(&page);
        if drafts.is_empty() {
            tracing::warn!(adapter = %self.config.id, url = %self.url, "No records found on page");
        }
        Ok(self.normalizer.normalize_all(drafts))
    }

    fn can_handle(&self, url: &str) -> bool {
        same_host(url, &self.config.urls())
    }

    async fn health_check(&self) -> HealthStatus {
        probe(self.fetcher.inner(), &self.request(&ScrapeOptions::new())).await
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }
}
