//! Failure ledger with exponential retry backoff.
//!
//! One row per `(category, url)`. Each failure bumps the retry count; a
//! resource becomes eligible again once `base * 2^(retries - 1)` (capped at
//! the configured ceiling) has elapsed since the last attempt. Success clears
//! the row. Upserts are single statements, so concurrent recorders never
//! lose an increment.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::LedgerConfig;
use crate::error::PipelineResult;
use crate::models::{FailureCategory, FailureRecord};

#[derive(Clone)]
pub struct FailureLedger {
    pool: SqlitePool,
    base: Duration,
    max: Duration,
}

impl FailureLedger {
    pub fn new(pool: SqlitePool, config: &LedgerConfig) -> Self {
        Self {
            pool,
            base: Duration::seconds(config.base_delay_secs as i64),
            max: Duration::seconds(config.max_delay_secs as i64),
        }
    }

    /// Backoff window after `retries` consecutive failures.
    pub fn backoff_window(&self, retries: i64) -> Duration {
        if retries <= 0 {
            return Duration::zero();
        }
        let exponent = (retries - 1).min(32) as u32;
        let secs = self
            .base
            .num_seconds()
            .saturating_mul(2_i64.saturating_pow(exponent));
        Duration::seconds(secs).min(self.max)
    }

    /// Record a failure. Returns the retry count after the increment.
    pub async fn record(
        &self,
        category: FailureCategory,
        url: &str,
        label: Option<&str>,
        error: &str,
    ) -> PipelineResult<i64> {
        self.record_at(category, url, label, error, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        category: FailureCategory,
        url: &str,
        label: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<i64> {
        let retries: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO failures (category, url, label, error, last_attempt, retries)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(category, url) DO UPDATE SET
                label = COALESCE(excluded.label, failures.label),
                error = excluded.error,
                last_attempt = excluded.last_attempt,
                retries = failures.retries + 1
            RETURNING retries
            "#,
        )
        .bind(category.as_str())
        .bind(url)
        .bind(label)
        .bind(truncate_error(error))
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(category = %category, url, retries, "failure recorded");
        Ok(retries)
    }

    pub async fn is_eligible(&self, category: FailureCategory, url: &str) -> PipelineResult<bool> {
        self.is_eligible_at(category, url, Utc::now()).await
    }

    pub async fn is_eligible_at(
        &self,
        category: FailureCategory,
        url: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let row = sqlx::query("SELECT last_attempt, retries FROM failures WHERE category = ? AND url = ?")
            .bind(category.as_str())
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(true);
        };

        let last_attempt: i64 = row.try_get("last_attempt")?;
        let retries: i64 = row.try_get("retries")?;
        let elapsed = now.timestamp() - last_attempt;
        Ok(elapsed >= self.backoff_window(retries).num_seconds())
    }

    /// Forget any failure for `url`; called after a success.
    pub async fn clear(&self, category: FailureCategory, url: &str) -> PipelineResult<bool> {
        let result = sqlx::query("DELETE FROM failures WHERE category = ? AND url = ?")
            .bind(category.as_str())
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All current records, optionally restricted to one category, most retried first.
    pub async fn list(&self, category: Option<FailureCategory>) -> PipelineResult<Vec<FailureRecord>> {
        let rows = match category {
            Some(c) => {
                sqlx::query(
                    "SELECT category, url, label, error, last_attempt, retries FROM failures \
                     WHERE category = ? ORDER BY retries DESC, url ASC",
                )
                .bind(c.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT category, url, label, error, last_attempt, retries FROM failures \
                     ORDER BY category ASC, retries DESC, url ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let category: String = row.try_get("category")?;
            let Ok(category) = category.parse::<FailureCategory>() else {
                tracing::warn!(category, "skipping failure row with unknown category");
                continue;
            };
            let last_attempt: i64 = row.try_get("last_attempt")?;
            records.push(FailureRecord {
                category,
                url: row.try_get("url")?,
                label: row.try_get("label")?,
                error: row.try_get("error")?,
                last_attempt: DateTime::from_timestamp(last_attempt, 0).unwrap_or_default(),
                retries: row.try_get("retries")?,
            });
        }
        Ok(records)
    }

    pub async fn count(&self, category: FailureCategory) -> PipelineResult<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM failures WHERE category = ?")
            .bind(category.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

fn truncate_error(error: &str) -> String {
    const MAX: usize = 500;
    if error.len() <= MAX {
        return error.to_string();
    }
    let mut end = MAX;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &error[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn ledger(base_secs: u64) -> FailureLedger {
        let pool = db::connect_in_memory().await.unwrap();
        migrate::apply(&pool).await.unwrap();
        FailureLedger::new(
            pool,
            &LedgerConfig {
                base_delay_secs: base_secs,
                max_delay_secs: 86_400,
            },
        )
    }

    const URL: &str = "https://example.com/feed.xml";

    #[tokio::test]
    async fn unknown_url_is_eligible() {
        let ledger = ledger(2).await;
        assert!(ledger.is_eligible(FailureCategory::OriginFetch, URL).await.unwrap());
    }

    #[tokio::test]
    async fn backoff_doubles_from_base() {
        let ledger = ledger(2).await;
        let t0 = Utc::now();
        for i in 0..3 {
            let retries = ledger
                .record_at(FailureCategory::OriginFetch, URL, None, "timeout", t0)
                .await
                .unwrap();
            assert_eq!(retries, i + 1);
        }

        let cat = FailureCategory::OriginFetch;
        assert!(!ledger.is_eligible_at(cat, URL, t0).await.unwrap());
        assert!(!ledger
            .is_eligible_at(cat, URL, t0 + Duration::seconds(7))
            .await
            .unwrap());
        assert!(ledger
            .is_eligible_at(cat, URL, t0 + Duration::seconds(8))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn window_is_capped() {
        let ledger = ledger(60).await;
        assert_eq!(ledger.backoff_window(0), Duration::zero());
        assert_eq!(ledger.backoff_window(1), Duration::seconds(60));
        assert_eq!(ledger.backoff_window(3), Duration::seconds(240));
        assert_eq!(ledger.backoff_window(40), Duration::seconds(86_400));
    }

    #[tokio::test]
    async fn categories_are_independent_and_clear_removes() {
        let ledger = ledger(60).await;
        ledger
            .record(FailureCategory::ItemFetch, URL, Some("Post"), "HTTP 500")
            .await
            .unwrap();

        assert!(!ledger.is_eligible(FailureCategory::ItemFetch, URL).await.unwrap());
        assert!(ledger.is_eligible(FailureCategory::Enrichment, URL).await.unwrap());

        let records = ledger.list(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label.as_deref(), Some("Post"));
        assert_eq!(records[0].error, "HTTP 500");

        assert!(ledger.clear(FailureCategory::ItemFetch, URL).await.unwrap());
        assert!(ledger.list(None).await.unwrap().is_empty());
        assert!(ledger.is_eligible(FailureCategory::ItemFetch, URL).await.unwrap());
    }

    #[test]
    fn long_errors_are_truncated_on_char_boundary() {
        let long = "é".repeat(400);
        let t = truncate_error(&long);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 503);
    }
}
