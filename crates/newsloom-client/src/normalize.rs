//! Shared post-processing applied by every adapter.
//!
//! Adapters turn their payload into [`ArticleDraft`]s; the [`Normalizer`]
//! cleans text, resolves links, gates on relevance, tags, scores, validates
//! and fills in deterministic fallbacks. Drafts that do not survive are
//! logged and dropped, never failing the batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use newsloom_core::config::AdapterConfig;
use newsloom_core::manager::canonical_url;
use newsloom_core::models::{Article, Category, SourceDescriptor, compute_hash};
use newsloom_core::relevance::{MAX_TAGS, RelevancePolicy, recency_score};
use scraper::Html;
use url::Url;

pub const MIN_TITLE_LEN: usize = 10;
pub const MIN_DESCRIPTION_LEN: usize = 20;

/// Raw fields pulled out of a feed item, API record or HTML block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleDraft {
    pub title: String,
    pub description: String,
    pub url: String,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
    /// Tags supplied by the source itself (feed categories and such).
    pub tags: Vec<String>,
}

/// Why a draft was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingUrl,
    OffTopic,
    TitleTooShort,
    DescriptionTooShort,
}

/// Turns drafts from one source into articles.
#[derive(Clone)]
pub struct Normalizer {
    source: SourceDescriptor,
    fixed_category: Option<Category>,
    base: Url,
    policy: Arc<dyn RelevancePolicy>,
}

impl Normalizer {
    pub fn new(config: &AdapterConfig, base: Url, policy: Arc<dyn RelevancePolicy>) -> Self {
        Self {
            source: SourceDescriptor {
                id: config.id.clone(),
                name: config.name.clone(),
                category: config.primary_category(),
            },
            fixed_category: config.categories.iter().next().copied(),
            base,
            policy,
        }
    }

    /// Same source, different base for link resolution.
    pub fn with_base(&self, base: Url) -> Self {
        Self {
            base,
            ..self.clone()
        }
    }

    pub fn normalize(&self, draft: ArticleDraft) -> Result<Article, Rejection> {
        self.normalize_at(draft, Utc::now())
    }

    fn normalize_at(&self, draft: ArticleDraft, now: DateTime<Utc>) -> Result<Article, Rejection> {
        let title = strip_markup(&draft.title);
        let description = strip_markup(&draft.description);
        let url = resolve_url(&self.base, &draft.url).ok_or(Rejection::MissingUrl)?;

        let assessment = self
            .policy
            .assess(&title, &description)
            .ok_or(Rejection::OffTopic)?;

        if title.chars().count() < MIN_TITLE_LEN {
            return Err(Rejection::TitleTooShort);
        }
        if description.chars().count() < MIN_DESCRIPTION_LEN {
            return Err(Rejection::DescriptionTooShort);
        }

        let category = self
            .fixed_category
            .or(assessment.category)
            .unwrap_or(Category::General);

        let mut tags: BTreeSet<String> = assessment.tags;
        for tag in draft.tags {
            if tags.len() >= MAX_TAGS {
                break;
            }
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() {
                tags.insert(tag);
            }
        }
        if tags.is_empty() {
            tags.insert(category.as_str().to_string());
        }

        let image_url = draft
            .image_url
            .and_then(|raw| resolve_url(&self.base, &raw))
            .or_else(|| Some(placeholder_image(category)));

        let canonical = canonical_url(&url);
        Ok(Article {
            id: compute_hash(&canonical)[..16].to_string(),
            title,
            description,
            url: canonical,
            image_url,
            published_at: draft.published_at,
            source: self.source.clone(),
            author: draft
                .author
                .map(|a| strip_markup(&a))
                .filter(|a| !a.is_empty()),
            category,
            tags,
            relevance: assessment.score,
            recency: recency_score(draft.published_at, now),
        })
    }

    /// Normalize a batch, logging and skipping rejected drafts.
    pub fn normalize_all(&self, drafts: Vec<ArticleDraft>) -> Vec<Article> {
        let total = drafts.len();
        let articles: Vec<Article> = drafts
            .into_iter()
            .filter_map(|draft| {
                let url = draft.url.clone();
                self.normalize(draft)
                    .map_err(|reason| {
                        tracing::debug!(
                            source = %self.source.id,
                            url = %url,
                            reason = ?reason,
                            "Skipping item"
                        );
                    })
                    .ok()
            })
            .collect();
        tracing::debug!(
            source = %self.source.id,
            kept = articles.len(),
            total,
            "Normalized items"
        );
        articles
    }
}

fn placeholder_image(category: Category) -> String {
    format!("https://placehold.co/600x400?text={}", category.as_str())
}

/// Text content of an HTML/XML fragment with entities decoded and
/// whitespace collapsed.
pub fn strip_markup(raw: &str) -> String {
    if !raw.contains('<') && !raw.contains('&') {
        return collapse_whitespace(raw);
    }
    let fragment = Html::parse_fragment(raw);
    let text: Vec<&str> = fragment.root_element().text().collect();
    collapse_whitespace(&text.join(" "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve `raw` against `base`. Only http(s) results are accepted.
pub fn resolve_url(base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let url = base.join(raw).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Parse the date formats seen in feeds and APIs.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    raw.parse::<i64>().ok().and_then(parse_epoch)
}

/// Seconds or milliseconds since the epoch.
pub fn parse_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value > 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}
