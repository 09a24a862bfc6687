//! Core data models used throughout Feed Harness.
//!
//! These types represent the origins, items, failure records and enrichment
//! results that flow through the ingestion and enrichment pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest valid enrichment score.
pub const SCORE_MIN: i64 = 1;
/// Highest valid enrichment score.
pub const SCORE_MAX: i64 = 10;

/// A subscribed feed source, as produced by the subscription loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub name: String,
    pub url: String,
    /// Human-facing site URL, carried through to the failure report.
    pub html_url: Option<String>,
}

impl Origin {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            html_url: None,
        }
    }
}

/// Closed set of item categories assigned by enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    AiMl,
    Security,
    Engineering,
    Tools,
    Opinion,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::AiMl,
        Category::Security,
        Category::Engineering,
        Category::Tools,
        Category::Opinion,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::AiMl => "ai-ml",
            Category::Security => "security",
            Category::Engineering => "engineering",
            Category::Tools => "tools",
            Category::Opinion => "opinion",
            Category::Other => "other",
        }
    }

    /// Map a free-form model answer onto the closed set; unknown labels become `Other`.
    pub fn from_label(label: &str) -> Category {
        let normalized = label.trim().to_ascii_lowercase().replace(['_', ' ', '/'], "-");
        match normalized.as_str() {
            "ai-ml" | "ai" | "ml" | "ai-ml-" | "aiml" => Category::AiMl,
            "security" => Category::Security,
            "engineering" => Category::Engineering,
            "tools" | "tool" => Category::Tools,
            "opinion" => Category::Opinion,
            _ => Category::Other,
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
        Category::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown category: '{}'", s))
    }
}

/// Relevance, quality and timeliness scores, each in `SCORE_MIN..=SCORE_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub relevance: i64,
    pub quality: i64,
    pub timeliness: i64,
}

/// An item ready for first insertion.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub url: String,
    pub title: String,
    pub source_name: String,
    pub origin_url: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub downloaded: DateTime<Utc>,
    /// Where the body was taken from: `page` or `feed`.
    pub content_source: String,
    pub body: String,
}

/// A stored item.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub source_name: String,
    pub origin_url: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub downloaded: DateTime<Utc>,
    pub content_source: String,
    pub body: String,
    pub summary: Option<String>,
    pub category: Option<Category>,
    pub scores: Option<Scores>,
    pub keywords: Vec<String>,
    pub checksum: String,
}

/// A field update that distinguishes "leave alone" from "clear".
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Keep,
    Set(T),
    Clear,
}

// Manual impl: the derive would require `T: Default`.
impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

/// Partial update applied by [`ItemStore::update`](crate::store::ItemStore::update).
///
/// Only non-`Keep` fields are written; a field becomes `NULL` only via `Patch::Clear`.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub title: Patch<String>,
    pub body: Patch<String>,
    pub published: Patch<DateTime<Utc>>,
    pub content_source: Patch<String>,
    pub summary: Patch<String>,
    pub category: Patch<Category>,
    pub scores: Patch<Scores>,
    pub keywords: Patch<Vec<String>>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_keep()
            && self.body.is_keep()
            && self.published.is_keep()
            && self.content_source.is_keep()
            && self.summary.is_keep()
            && self.category.is_keep()
            && self.scores.is_keep()
            && self.keywords.is_keep()
    }

    /// Patch carrying every enrichment-owned field.
    pub fn from_enrichment(e: &Enrichment) -> Self {
        Self {
            summary: Patch::Set(e.summary.clone()),
            category: Patch::Set(e.category),
            scores: match e.scores {
                Some(s) => Patch::Set(s),
                None => Patch::Keep,
            },
            keywords: Patch::Set(e.keywords.clone()),
            ..Default::default()
        }
    }
}

/// Validated output of one enrichment call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub summary: String,
    pub category: Category,
    pub scores: Option<Scores>,
    pub keywords: Vec<String>,
}

/// The three classes of tracked failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    OriginFetch,
    ItemFetch,
    Enrichment,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 3] = [
        FailureCategory::OriginFetch,
        FailureCategory::ItemFetch,
        FailureCategory::Enrichment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::OriginFetch => "origin_fetch",
            FailureCategory::ItemFetch => "item_fetch",
            FailureCategory::Enrichment => "enrichment",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureCategory::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown failure category: '{}'", s))
    }
}

/// One row of the Failure Ledger.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub url: String,
    /// Display name of the failing resource when known (origin or item title).
    pub label: Option<String>,
    pub error: String,
    pub last_attempt: DateTime<Utc>,
    pub retries: i64,
}

/// Conditional-request validator captured from a previous response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validator {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A search hit returned to the reader UI.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub item: Item,
    /// BM25-derived relevance (higher is better); `0.0` for non-text queries.
    pub text_score: f64,
    pub snippet: Option<String>,
}

/// One page of ranked search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
}
