//! Error taxonomy shared by the pipeline components.
//!
//! Component boundaries (store, fetch path, enrichment client) return
//! [`PipelineError`] so callers can tell an expected duplicate apart from a
//! storage failure or an exhausted model list. Orchestration and CLI code
//! wraps these in `anyhow::Error` with context.

use thiserror::Error;

/// Failure classes surfaced by the ingestion and enrichment pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network-level failure or retryable HTTP status; retried per backoff policy.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The remote refused the request permanently (4xx other than 429).
    #[error("HTTP {status}")]
    Http { status: u16 },

    /// Insert of a URL that is already stored. Expected during dedup races.
    #[error("item already exists: {url}")]
    Conflict { url: String },

    /// Every enrichment candidate was exhausted without a valid response.
    #[error("enrichment unavailable: {last_error}")]
    EnrichmentUnavailable { last_error: String },

    /// Storage-layer failure; aborts the current unit of work.
    #[error("store error: {0}")]
    StoreIo(#[from] sqlx::Error),

    /// A remote response could not be turned into a valid enrichment.
    #[error("invalid enrichment response: {0}")]
    Validation(String),

    /// Readable text could not be extracted from fetched content.
    #[error("content extraction failed: {0}")]
    Extraction(String),

    /// URL rejected by the SSRF guard before any request was made.
    #[error("blocked url: {url} ({reason})")]
    Blocked { url: String, reason: String },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether another attempt against the same remote may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientNetwork(_))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                PipelineError::Http {
                    status: status.as_u16(),
                }
            }
            _ => PipelineError::TransientNetwork(e.to_string()),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
