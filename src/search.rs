//! Search request model and query language.
//!
//! User queries use a small boolean-ish language that is compiled into an
//! FTS5 `MATCH` expression:
//!
//! | Input            | Meaning                                  |
//! |------------------|------------------------------------------|
//! | `rust async`     | both terms must match (implicit AND)     |
//! | `"memory safety"`| the phrase must match contiguously       |
//! | `rust OR go`     | either adjacent term may match           |
//! | `-crypto`        | items matching the term are excluded     |
//!
//! Every term is emitted as a quoted FTS5 string, so punctuation in user
//! input can never be interpreted as FTS5 syntax.
//!
//! Execution lives in [`ItemStore::search`](crate::store::ItemStore::search);
//! this module only owns the request types and the `fh search` printer.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::str::FromStr;

use crate::config::Config;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::Category;
use crate::store::ItemStore;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    /// Newest first by published time (download time when unknown).
    #[default]
    Recency,
    /// Relevance, then quality, then timeliness, all descending; unscored as zero.
    Score,
    /// Alphabetical by source name, newest first within a source.
    Source,
    /// Full-text relevance (BM25). Falls back to recency without a text query.
    Relevance,
}

impl FromStr for SortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recency" | "date" => Ok(SortMode::Recency),
            "score" => Ok(SortMode::Score),
            "source" => Ok(SortMode::Source),
            "relevance" | "text" => Ok(SortMode::Relevance),
            other => Err(format!(
                "unknown sort mode: '{}'. Use recency, score, source, or relevance.",
                other
            )),
        }
    }
}

/// Narrowing filters applied alongside the text query.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub category: Option<Category>,
    pub source_name: Option<String>,
    /// Inclusive lower bound on publication time.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on publication time.
    pub until: Option<DateTime<Utc>>,
}

/// A complete search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub filters: SearchFilters,
    pub sort: SortMode,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            filters: SearchFilters::default(),
            sort: SortMode::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Clamp paging into range: page ≥ 1, page size in `1..=MAX_PAGE_SIZE`.
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.page_size as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Term(String),
    Phrase(String),
    Not(Box<Token>),
    Or,
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let negated = c == '-';
        if negated {
            chars.next();
        }

        let token = match chars.peek() {
            Some('"') => {
                chars.next();
                let mut phrase = String::new();
                for ch in chars.by_ref() {
                    if ch == '"' {
                        break;
                    }
                    phrase.push(ch);
                }
                Token::Phrase(phrase)
            }
            Some(_) => {
                let mut term = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '"' {
                        break;
                    }
                    term.push(ch);
                    chars.next();
                }
                if term == "OR" && !negated {
                    Token::Or
                } else {
                    Token::Term(term)
                }
            }
            None => break,
        };

        // Drop tokens that carry no indexable characters ("-", "!!", "").
        let indexable = match &token {
            Token::Term(t) | Token::Phrase(t) => t.chars().any(|ch| ch.is_alphanumeric()),
            _ => true,
        };
        if !indexable {
            continue;
        }

        tokens.push(if negated {
            Token::Not(Box::new(token))
        } else {
            token
        });
    }

    tokens
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn render(token: &Token) -> Option<String> {
    match token {
        Token::Term(t) | Token::Phrase(t) => Some(quote(t.trim())),
        _ => None,
    }
}

/// Compile a user query into an FTS5 `MATCH` expression.
///
/// Returns `Ok(None)` for a query with no usable terms. A query made only of
/// negations is rejected since FTS5 cannot express a bare `NOT`.
pub fn to_fts_query(input: &str) -> PipelineResult<Option<String>> {
    let tokens = tokenize(input);

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut negations: Vec<String> = Vec::new();
    let mut pending_or = false;

    for token in &tokens {
        match token {
            Token::Or => {
                pending_or = !groups.is_empty();
            }
            Token::Not(inner) => {
                if let Some(rendered) = render(inner) {
                    negations.push(rendered);
                }
                pending_or = false;
            }
            positive => {
                let Some(rendered) = render(positive) else {
                    continue;
                };
                match groups.last_mut() {
                    Some(group) if pending_or => group.push(rendered),
                    _ => groups.push(vec![rendered]),
                }
                pending_or = false;
            }
        }
    }

    if groups.is_empty() {
        if negations.is_empty() {
            return Ok(None);
        }
        return Err(PipelineError::Validation(
            "query must contain at least one term that is not negated".to_string(),
        ));
    }

    let mut expr = groups
        .iter()
        .map(|group| {
            if group.len() == 1 {
                group[0].clone()
            } else {
                format!("({})", group.join(" OR "))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    if !negations.is_empty() {
        expr = format!("({})", expr);
        for neg in &negations {
            expr.push_str(" NOT ");
            expr.push_str(neg);
        }
    }

    Ok(Some(expr))
}

/// Parse a `YYYY-MM-DD` or RFC 3339 date into a UTC timestamp.
///
/// Bare dates resolve to the start of the day, or the end of the day when
/// `end_of_day` is set, so `--until 2024-01-31` includes that whole day.
pub fn parse_date_bound(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(d) => d,
        Err(_) => bail!("invalid date '{}': expected YYYY-MM-DD or RFC 3339", value),
    };
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    match time {
        Some(t) => Ok(t.and_utc()),
        None => bail!("invalid date '{}'", value),
    }
}

/// CLI entry point for `fh search`.
pub async fn run_search(config: &Config, request: SearchRequest) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = ItemStore::new(pool.clone());
    let request = request.normalized();

    let page = store.search(&request).await?;

    if page.hits.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    let first = request.offset() + 1;
    for (i, hit) in page.hits.iter().enumerate() {
        let item = &hit.item;
        let date = item
            .published
            .unwrap_or(item.downloaded)
            .format("%Y-%m-%d")
            .to_string();

        let scores = match item.scores {
            Some(s) => format!("{}/{}/{}", s.relevance, s.quality, s.timeliness),
            None => "-".to_string(),
        };

        println!(
            "{}. [{}] {} / {}",
            first + i as i64,
            scores,
            item.source_name,
            item.title
        );
        println!("    published: {}", date);
        if let Some(category) = item.category {
            println!("    category: {}", category);
        }
        println!("    url: {}", item.url);
        if let Some(ref snippet) = hit.snippet {
            println!("    excerpt: \"{}\"", snippet.replace('\n', " ").trim());
        } else if let Some(ref summary) = item.summary {
            println!("    summary: {}", summary.replace('\n', " ").trim());
        }
        println!();
    }

    let pages = (page.total + page.page_size as i64 - 1) / page.page_size as i64;
    println!(
        "page {} of {} ({} matching items)",
        page.page,
        pages.max(1),
        page.total
    );

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fts(q: &str) -> Option<String> {
        to_fts_query(q).unwrap()
    }

    #[test]
    fn bare_terms_are_anded() {
        assert_eq!(fts("rust async").unwrap(), r#""rust" AND "async""#);
    }

    #[test]
    fn phrases_stay_contiguous() {
        assert_eq!(
            fts(r#""memory safety" rust"#).unwrap(),
            r#""memory safety" AND "rust""#
        );
    }

    #[test]
    fn or_joins_adjacent_terms() {
        assert_eq!(
            fts("rust OR go tokio").unwrap(),
            r#"("rust" OR "go") AND "tokio""#
        );
        // lowercase "or" is an ordinary term
        assert_eq!(fts("this or that").unwrap(), r#""this" AND "or" AND "that""#);
    }

    #[test]
    fn leading_minus_negates() {
        assert_eq!(
            fts(r#"rust -crypto -"block chain""#).unwrap(),
            r#"("rust") NOT "crypto" NOT "block chain""#
        );
    }

    #[test]
    fn punctuation_cannot_inject_syntax() {
        assert_eq!(fts("c++ AND*").unwrap(), r#""c++" AND "AND*""#);
        assert_eq!(fts(r#"say"hi"#).unwrap(), r#""say" AND "hi""#);
    }

    #[test]
    fn empty_and_negation_only_queries() {
        assert_eq!(fts("   "), None);
        assert_eq!(fts("- !!"), None);
        assert!(to_fts_query("-spam").is_err());
    }

    #[test]
    fn dangling_or_is_ignored() {
        assert_eq!(fts("OR rust OR").unwrap(), r#""rust""#);
    }

    #[test]
    fn paging_is_clamped() {
        let req = SearchRequest {
            page: 0,
            page_size: 10_000,
            ..Default::default()
        }
        .normalized();
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, MAX_PAGE_SIZE);
        assert_eq!(req.offset(), 0);

        let req = SearchRequest {
            page: 3,
            page_size: 20,
            ..Default::default()
        };
        assert_eq!(req.offset(), 40);
    }

    #[test]
    fn date_bounds_cover_whole_day() {
        let start = parse_date_bound("2024-01-31", false).unwrap();
        let end = parse_date_bound("2024-01-31", true).unwrap();
        assert_eq!((end - start).num_seconds(), 86_399);
        assert!(parse_date_bound("31/01/2024", false).is_err());
    }
}
