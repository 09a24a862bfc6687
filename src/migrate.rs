use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an already-open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Items: one row per distinct URL
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            source_name TEXT NOT NULL,
            origin_url TEXT,
            published INTEGER,
            downloaded INTEGER NOT NULL,
            content_source TEXT NOT NULL DEFAULT 'page',
            body TEXT NOT NULL,
            summary TEXT,
            category TEXT,
            score_relevance INTEGER,
            score_quality INTEGER,
            score_timeliness INTEGER,
            keywords TEXT NOT NULL DEFAULT '[]',
            checksum TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Failure ledger: one row per (category, url)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS failures (
            category TEXT NOT NULL,
            url TEXT NOT NULL,
            label TEXT,
            error TEXT NOT NULL,
            last_attempt INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (category, url)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Conditional-request validators
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fetch_validators (
            url TEXT PRIMARY KEY,
            etag TEXT,
            last_modified TEXT,
            captured_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Enrichment response cache, keyed by request payload hash
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_cache (
            key TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            response_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='items_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        // rowid mirrors items.id; rows are maintained by the store, not by triggers
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE items_fts USING fts5(
                title,
                summary,
                body,
                keywords,
                tokenize = 'porter unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_published ON items(published DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_source_name ON items(source_name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_category ON items(category)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_enrichment_cache_created ON enrichment_cache(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = db::connect_in_memory().await.unwrap();
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE name IN \
             ('items', 'items_fts', 'failures', 'fetch_validators', 'enrichment_cache')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 5);
    }
}
