//! Conditional fetch cache.
//!
//! Stores the `ETag` / `Last-Modified` validators returned by origins so the
//! next fetch can ask for `304 Not Modified`. Entries older than the
//! configured maximum age read as absent, which forces a full fetch and
//! bounds how long a stale validator can mask new content.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::PipelineResult;
use crate::models::Validator;

#[derive(Clone)]
pub struct ConditionalFetchCache {
    pool: SqlitePool,
    max_age: Duration,
}

impl ConditionalFetchCache {
    pub fn new(pool: SqlitePool, max_age_days: i64) -> Self {
        Self {
            pool,
            max_age: Duration::days(max_age_days),
        }
    }

    pub async fn get(&self, url: &str) -> PipelineResult<Option<Validator>> {
        self.get_at(url, Utc::now()).await
    }

    pub async fn get_at(&self, url: &str, now: DateTime<Utc>) -> PipelineResult<Option<Validator>> {
        let row = sqlx::query(
            "SELECT etag, last_modified, captured_at FROM fetch_validators WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let captured_at: i64 = row.try_get("captured_at")?;
        if now.timestamp() - captured_at > self.max_age.num_seconds() {
            return Ok(None);
        }

        let validator = Validator {
            etag: row.try_get("etag")?,
            last_modified: row.try_get("last_modified")?,
        };
        Ok((!validator.is_empty()).then_some(validator))
    }

    /// Store the validator for `url`. An empty validator removes any previous entry.
    pub async fn put(&self, url: &str, validator: &Validator) -> PipelineResult<()> {
        self.put_at(url, validator, Utc::now()).await
    }

    pub async fn put_at(
        &self,
        url: &str,
        validator: &Validator,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        if validator.is_empty() {
            sqlx::query("DELETE FROM fetch_validators WHERE url = ?")
                .bind(url)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO fetch_validators (url, etag, last_modified, captured_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                captured_at = excluded.captured_at
            "#,
        )
        .bind(url)
        .bind(&validator.etag)
        .bind(&validator.last_modified)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove (or with `dry_run`, count) entries past the maximum age.
    pub async fn purge_expired(&self, dry_run: bool) -> PipelineResult<u64> {
        let cutoff = Utc::now().timestamp() - self.max_age.num_seconds();
        if dry_run {
            let n: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM fetch_validators WHERE captured_at < ?")
                    .bind(cutoff)
                    .fetch_one(&self.pool)
                    .await?;
            return Ok(n as u64);
        }
        let result = sqlx::query("DELETE FROM fetch_validators WHERE captured_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn cache() -> ConditionalFetchCache {
        let pool = db::connect_in_memory().await.unwrap();
        migrate::apply(&pool).await.unwrap();
        ConditionalFetchCache::new(pool, 30)
    }

    fn etag(tag: &str) -> Validator {
        Validator {
            etag: Some(tag.to_string()),
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn absent_is_none() {
        let cache = cache().await;
        assert_eq!(cache.get("https://example.com/feed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_then_get_and_overwrite() {
        let cache = cache().await;
        let url = "https://example.com/feed";
        cache.put(url, &etag("\"v1\"")).await.unwrap();
        assert_eq!(cache.get(url).await.unwrap(), Some(etag("\"v1\"")));

        cache.put(url, &etag("\"v2\"")).await.unwrap();
        assert_eq!(cache.get(url).await.unwrap(), Some(etag("\"v2\"")));

        cache.put(url, &Validator::default()).await.unwrap();
        assert_eq!(cache.get(url).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_entries_read_as_absent() {
        let cache = cache().await;
        let url = "https://example.com/feed";
        let captured = Utc::now() - Duration::days(31);
        cache.put_at(url, &etag("\"old\""), captured).await.unwrap();

        assert_eq!(cache.get(url).await.unwrap(), None);
        assert_eq!(
            cache
                .get_at(url, captured + Duration::days(29))
                .await
                .unwrap(),
            Some(etag("\"old\""))
        );
        cache.put("https://example.com/fresh", &etag("\"new\"")).await.unwrap();
        assert_eq!(cache.purge_expired(true).await.unwrap(), 1);
        assert_eq!(cache.purge_expired(false).await.unwrap(), 1);
        assert_eq!(cache.purge_expired(false).await.unwrap(), 0);
        assert_eq!(
            cache.get("https://example.com/fresh").await.unwrap(),
            Some(etag("\"new\""))
        );
    }
}
