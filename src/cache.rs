//! Content-addressed cache of validated enrichment responses.
//!
//! The key is the SHA-256 of `model|system_prompt|user_message`, so the same
//! normalized request against the same model always maps to the same entry.
//! A hit short-circuits the remote call entirely. Entries expire after the
//! configured age and can be purged with `fh clean-cache`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::{Config, MAX_RETENTION_DAYS};
use crate::db;
use crate::error::PipelineResult;
use crate::metrics::{CACHE_HITS, CACHE_MISSES};
use crate::models::Enrichment;
use crate::validators::ConditionalFetchCache;

/// Deterministic cache key for one request payload.
pub fn cache_key(model: &str, system: &str, user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"|");
    hasher.update(system.as_bytes());
    hasher.update(b"|");
    hasher.update(user.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct EnrichmentCache {
    pool: SqlitePool,
    ttl: Duration,
}

impl EnrichmentCache {
    pub fn new(pool: SqlitePool, max_age_days: i64) -> Self {
        Self {
            pool,
            ttl: Duration::days(max_age_days),
        }
    }

    pub async fn get(&self, key: &str) -> PipelineResult<Option<Enrichment>> {
        self.get_at(key, Utc::now()).await
    }

    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> PipelineResult<Option<Enrichment>> {
        let found = self.lookup(key, now).await?;
        if found.is_some() {
            counter!(CACHE_HITS).increment(1);
        } else {
            counter!(CACHE_MISSES).increment(1);
        }
        Ok(found)
    }

    async fn lookup(&self, key: &str, now: DateTime<Utc>) -> PipelineResult<Option<Enrichment>> {
        let row = sqlx::query("SELECT response_json, expires_at FROM enrichment_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: Option<i64> = row.try_get("expires_at")?;
        if matches!(expires_at, Some(exp) if exp <= now.timestamp()) {
            return Ok(None);
        }

        let json: String = row.try_get("response_json")?;
        match serde_json::from_str(&json) {
            Ok(enrichment) => Ok(Some(enrichment)),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    pub async fn put(&self, key: &str, model: &str, enrichment: &Enrichment) -> PipelineResult<()> {
        let now = Utc::now();
        let json = serde_json::to_string(enrichment)
            .map_err(|e| crate::error::PipelineError::Validation(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO enrichment_cache (key, model, response_json, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                model = excluded.model,
                response_json = excluded.response_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(model)
        .bind(json)
        .bind(now.timestamp())
        .bind((now + self.ttl).timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove (or with `dry_run`, count) entries created more than `days` ago.
    pub async fn purge_older_than(&self, days: i64, dry_run: bool) -> PipelineResult<u64> {
        let cutoff = (Utc::now() - Duration::days(days)).timestamp();
        if dry_run {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_cache WHERE created_at < ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
            return Ok(n as u64);
        }
        let result = sqlx::query("DELETE FROM enrichment_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn len(&self) -> PipelineResult<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

/// CLI entry point for `fh clean-cache`.
pub async fn run_clean_cache(config: &Config, days: Option<i64>, dry_run: bool) -> Result<()> {
    let days = days.unwrap_or(config.enrichment.cache_max_age_days);
    if !(0..=MAX_RETENTION_DAYS).contains(&days) {
        anyhow::bail!("--days must be in [0, {}]", MAX_RETENTION_DAYS);
    }

    let pool = db::connect(config).await?;
    let cache = EnrichmentCache::new(pool.clone(), config.enrichment.cache_max_age_days);
    let validators =
        ConditionalFetchCache::new(pool.clone(), config.download.validator_max_age_days);

    let total = cache.len().await?;
    let removed = cache.purge_older_than(days, dry_run).await?;
    let stale_validators = validators.purge_expired(dry_run).await?;

    if dry_run {
        println!("clean-cache (dry-run)");
        println!("  entries: {}", total);
        println!("  would remove: {} (older than {} days)", removed, days);
        println!(
            "  validators: {} past {} days",
            stale_validators, config.download.validator_max_age_days
        );
    } else {
        println!("clean-cache");
        println!("  removed: {} (older than {} days)", removed, days);
        println!("  remaining: {}", total - removed as i64);
        println!(
            "  validators removed: {} (older than {} days)",
            stale_validators, config.download.validator_max_age_days
        );
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::{Category, Validator};

    async fn cache() -> EnrichmentCache {
        let pool = db::connect_in_memory().await.unwrap();
        migrate::apply(&pool).await.unwrap();
        EnrichmentCache::new(pool, 30)
    }

    fn sample() -> Enrichment {
        Enrichment {
            summary: "A summary.".to_string(),
            category: Category::Tools,
            scores: None,
            keywords: vec!["cli".to_string()],
        }
    }

    #[test]
    fn keys_are_deterministic_and_model_specific() {
        let a = cache_key("m1", "sys", "user");
        assert_eq!(a, cache_key("m1", "sys", "user"));
        assert_ne!(a, cache_key("m2", "sys", "user"));
        assert_ne!(a, cache_key("m1", "sys", "user "));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn round_trip_and_expiry() {
        let cache = cache().await;
        cache.put("k", "m1", &sample()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(sample()));
        assert_eq!(
            cache.get_at("k", Utc::now() + Duration::days(31)).await.unwrap(),
            None
        );
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn purge_respects_dry_run() {
        let cache = cache().await;
        cache.put("k", "m1", &sample()).await.unwrap();
        sqlx::query("UPDATE enrichment_cache SET created_at = created_at - 864000")
            .execute(&cache.pool)
            .await
            .unwrap();

        assert_eq!(cache.purge_older_than(5, true).await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 1);
        assert_eq!(cache.purge_older_than(5, false).await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    async fn validator_count(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM fetch_validators")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn clean_cache_drops_stale_validators() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::minimal(tmp.path().join("fh.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();

        let max_age = config.download.validator_max_age_days;
        let validators = ConditionalFetchCache::new(pool.clone(), max_age);
        let tag = Validator {
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
        };
        validators
            .put_at("https://example.com/old.xml", &tag, Utc::now() - Duration::days(max_age + 1))
            .await
            .unwrap();
        validators.put("https://example.com/new.xml", &tag).await.unwrap();

        run_clean_cache(&config, None, true).await.unwrap();
        assert_eq!(validator_count(&pool).await, 2);

        run_clean_cache(&config, None, false).await.unwrap();
        assert_eq!(validator_count(&pool).await, 1);
        assert!(validators.get("https://example.com/new.xml").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clean_cache_rejects_out_of_range_days() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::minimal(tmp.path().join("fh.sqlite"));
        assert!(run_clean_cache(&config, Some(-1), true).await.is_err());
        assert!(run_clean_cache(&config, Some(i64::MAX), true).await.is_err());
    }
}
