//! Topical relevance: the keyword gate, scoring, tagging and category inference.
//!
//! The gate and scoring rules live behind [`RelevancePolicy`] so callers can
//! swap the default English keyword heuristic for their own.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::Category;

pub const BASE_SCORE: f64 = 0.5;
pub const MAX_TAGS: usize = 5;

const HIGH_VALUE_BONUS: f64 = 0.1;
const HIGH_VALUE_CAP: f64 = 0.3;
const ENTITY_BONUS: f64 = 0.05;
const ENTITY_CAP: f64 = 0.1;
const DENSITY_WEIGHT: f64 = 2.0;
const DENSITY_CAP: f64 = 0.1;

const GATE_KEYWORDS: &[&str] = &[
    "ai",
    "artificial intelligence",
    "machine learning",
    "deep learning",
    "neural",
    "llm",
    "llms",
    "language model",
    "gpt",
    "transformer",
    "chatbot",
    "generative",
    "computer vision",
    "nlp",
    "robotics",
    "data science",
];

const HIGH_VALUE_KEYWORDS: &[&str] = &[
    "breakthrough",
    "state of the art",
    "open source",
    "launch",
    "launches",
    "release",
    "releases",
    "benchmark",
    "agi",
    "regulation",
];

const ENTITIES: &[&str] = &[
    "openai",
    "anthropic",
    "deepmind",
    "google",
    "microsoft",
    "meta",
    "nvidia",
    "hugging face",
    "mistral",
    "apple",
    "amazon",
    "ibm",
];

const TECHNICAL_TERMS: &[&str] = &[
    "transformer",
    "diffusion",
    "reinforcement learning",
    "fine tuning",
    "embedding",
    "embeddings",
    "inference",
    "training",
    "parameters",
    "dataset",
    "gpu",
    "attention",
    "multimodal",
    "reasoning",
    "agent",
    "agents",
    "rag",
];

const TAG_VOCABULARY: &[(&str, &[&str])] = &[
    ("llm", &["llm", "llms", "language model", "gpt", "chatbot"]),
    ("computer-vision", &["computer vision", "image recognition", "vision model"]),
    ("generative", &["generative", "diffusion", "image generation"]),
    ("robotics", &["robot", "robots", "robotics"]),
    ("research", &["paper", "arxiv", "study", "research"]),
    ("open-source", &["open source", "github", "open weights"]),
    ("policy", &["regulation", "law", "policy", "act"]),
    ("funding", &["funding", "raises", "investment", "valuation"]),
    ("safety", &["safety", "alignment", "risk"]),
    ("hardware", &["gpu", "chip", "chips", "tpu"]),
    ("agents", &["agent", "agents", "agentic"]),
];

const CATEGORY_HINTS: &[(Category, &[&str])] = &[
    (Category::Research, &["paper", "arxiv", "study", "researchers", "preprint"]),
    (Category::Policy, &["regulation", "law", "policy", "government", "senate", "act"]),
    (Category::Industry, &["funding", "startup", "acquisition", "acquires", "revenue", "valuation"]),
    (Category::Tools, &["library", "framework", "sdk", "api", "plugin", "tool"]),
    (Category::Community, &["discussion", "forum", "community", "meetup", "ask"]),
];

/// Outcome of a successful relevance assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// In [0, 1].
    pub score: f64,
    pub tags: BTreeSet<String>,
    pub category: Option<Category>,
}

/// Decides whether content is on-topic and how well it fits.
pub trait RelevancePolicy: Send + Sync + Debug {
    /// Returns `None` when the content must be discarded.
    fn assess(&self, title: &str, description: &str) -> Option<Assessment>;
}

/// What to do with content that does not contain any gate keyword.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateMode {
    Exclude,
    /// Keep the content but subtract this penalty from its score.
    Downrank(f64),
}

/// The default keyword heuristic.
#[derive(Debug, Clone)]
pub struct KeywordPolicy {
    pub gate: GateMode,
}

impl Default for KeywordPolicy {
    fn default() -> Self {
        Self {
            gate: GateMode::Exclude,
        }
    }
}

impl KeywordPolicy {
    pub fn new(gate: GateMode) -> Self {
        Self { gate }
    }

    pub fn passes_gate(&self, text: &str) -> bool {
        Tokens::new(text).count_any(GATE_KEYWORDS) > 0
    }

    /// Relevance score in [0, 1], starting from [`BASE_SCORE`].
    pub fn score(&self, text: &str) -> f64 {
        let tokens = Tokens::new(text);
        let high_value =
            (tokens.count_any(HIGH_VALUE_KEYWORDS) as f64 * HIGH_VALUE_BONUS).min(HIGH_VALUE_CAP);
        let entities = (tokens.count_any(ENTITIES) as f64 * ENTITY_BONUS).min(ENTITY_CAP);
        let density = if tokens.word_count == 0 {
            0.0
        } else {
            let technical = tokens.count_any(TECHNICAL_TERMS) as f64;
            (technical / tokens.word_count as f64 * DENSITY_WEIGHT).min(DENSITY_CAP)
        };
        (BASE_SCORE + high_value + entities + density).clamp(0.0, 1.0)
    }

    /// Up to [`MAX_TAGS`] tags from the fixed vocabulary.
    pub fn extract_tags(&self, text: &str) -> BTreeSet<String> {
        let tokens = Tokens::new(text);
        TAG_VOCABULARY
            .iter()
            .filter(|(_, keywords)| tokens.count_any(keywords) > 0)
            .take(MAX_TAGS)
            .map(|(tag, _)| tag.to_string())
            .collect()
    }

    pub fn infer_category(&self, text: &str) -> Option<Category> {
        let tokens = Tokens::new(text);
        CATEGORY_HINTS
            .iter()
            .map(|(category, hints)| (*category, tokens.count_any(hints)))
            .filter(|(_, hits)| *hits > 0)
            .max_by_key(|(_, hits)| *hits)
            .map(|(category, _)| category)
    }
}

impl RelevancePolicy for KeywordPolicy {
    fn assess(&self, title: &str, description: &str) -> Option<Assessment> {
        let text = format!("{title} {description}");
        let mut score = self.score(&text);
        if !self.passes_gate(&text) {
            match self.gate {
                GateMode::Exclude => return None,
                GateMode::Downrank(penalty) => score = (score - penalty).clamp(0.0, 1.0),
            }
        }
        Some(Assessment {
            score,
            tags: self.extract_tags(&text),
            category: self.infer_category(&text),
        })
    }
}

/// Freshness in [0, 1]: 1.0 within a day, linear decay to 0.0 at a week.
/// Unknown publish times score 0.5.
pub fn recency_score(published: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(published) = published else {
        return 0.5;
    };
    let age = now - published;
    let fresh = TimeDelta::hours(24);
    let stale = TimeDelta::days(7);
    if age <= fresh {
        1.0
    } else if age >= stale {
        0.0
    } else {
        let span = (stale - fresh).num_seconds() as f64;
        1.0 - (age - fresh).num_seconds() as f64 / span
    }
}

/// Lowercased word view of a text for keyword membership tests.
struct Tokens {
    words: HashSet<String>,
    /// Words joined by single spaces and padded, for phrase matching.
    joined: String,
    word_count: usize,
}

impl Tokens {
    fn new(text: &str) -> Self {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let joined = format!(" {} ", words.join(" "));
        Self {
            word_count: words.len(),
            words: words.into_iter().collect(),
            joined,
        }
    }

    fn contains(&self, keyword: &str) -> bool {
        if keyword.contains(' ') {
            self.joined.contains(&format!(" {keyword} "))
        } else {
            self.words.contains(keyword)
        }
    }

    /// Number of distinct keywords from `keywords` present in the text.
    fn count_any(&self, keywords: &[&str]) -> usize {
        keywords.iter().filter(|k| self.contains(k)).count()
    }
}
