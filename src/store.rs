//! Durable item store with a synchronously maintained full-text index.
//!
//! Every write runs inside a single SQLite transaction that touches both the
//! `items` row and its `items_fts` entry, so a committed item is always
//! searchable and a deleted item is never returned by a later query. Writes
//! are additionally serialized through an async mutex: SQLite allows only one
//! writer at a time, and queueing writers here avoids `SQLITE_BUSY` upgrades
//! between pooled connections. Readers never take the mutex and observe only
//! committed state (WAL mode).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteRow, SqliteConnection};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{PipelineError, PipelineResult};
use crate::extract::checksum;
use crate::models::{Category, Item, ItemPatch, NewItem, Patch, Scores, SearchHit, SearchPage};
use crate::search::{self, SearchRequest, SortMode};

const ITEM_COLUMNS: &str = "items.id, items.url, items.title, items.source_name, \
    items.origin_url, items.published, items.downloaded, items.content_source, items.body, \
    items.summary, items.category, items.score_relevance, items.score_quality, \
    items.score_timeliness, items.keywords, items.checksum";

/// Aggregate counts reported by `fh stats`, `/stats` and the health check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_items: i64,
    pub with_summary: i64,
    pub without_summary: i64,
    pub by_source: Vec<(String, i64)>,
    pub by_category: Vec<(String, i64)>,
    pub failures: Vec<(String, i64)>,
    pub last_downloaded: Option<i64>,
}

impl StoreStats {
    pub fn total_failures(&self) -> i64 {
        self.failures.iter().map(|(_, n)| n).sum()
    }
}

/// Handle to the item table and its index. Cheap to clone.
#[derive(Clone)]
pub struct ItemStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl ItemStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new item, returning its id. Fails with `Conflict` when the URL exists.
    pub async fn insert(&self, item: &NewItem) -> PipelineResult<i64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO items (url, title, source_name, origin_url, published, downloaded,
                               content_source, body, checksum)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.url)
        .bind(&item.title)
        .bind(&item.source_name)
        .bind(&item.origin_url)
        .bind(item.published.map(|p| p.timestamp()))
        .bind(item.downloaded.timestamp())
        .bind(&item.content_source)
        .bind(&item.body)
        .bind(checksum(&item.body))
        .execute(&mut *tx)
        .await;

        let id = match result {
            Ok(r) => r.last_insert_rowid(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(PipelineError::Conflict {
                    url: item.url.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        reindex(&mut tx, id).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Apply the non-`Keep` fields of `patch`. Returns `false` when no item has `id`.
    pub async fn update(&self, id: i64, patch: &ItemPatch) -> PipelineResult<bool> {
        if patch.is_empty() {
            return self.exists_id(id).await;
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE items SET ");
        {
            let mut set = qb.separated(", ");

            match &patch.title {
                Patch::Set(v) => {
                    set.push("title = ").push_bind_unseparated(v.clone());
                }
                Patch::Clear => return Err(required_field("title")),
                Patch::Keep => {}
            }
            match &patch.body {
                Patch::Set(v) => {
                    set.push("body = ").push_bind_unseparated(v.clone());
                    set.push("checksum = ").push_bind_unseparated(checksum(v));
                }
                Patch::Clear => return Err(required_field("body")),
                Patch::Keep => {}
            }
            match &patch.content_source {
                Patch::Set(v) => {
                    set.push("content_source = ").push_bind_unseparated(v.clone());
                }
                Patch::Clear => return Err(required_field("content_source")),
                Patch::Keep => {}
            }
            match &patch.published {
                Patch::Set(v) => {
                    set.push("published = ").push_bind_unseparated(v.timestamp());
                }
                Patch::Clear => {
                    set.push("published = NULL");
                }
                Patch::Keep => {}
            }
            match &patch.summary {
                Patch::Set(v) => {
                    set.push("summary = ").push_bind_unseparated(v.clone());
                }
                Patch::Clear => {
                    set.push("summary = NULL");
                }
                Patch::Keep => {}
            }
            match &patch.category {
                Patch::Set(v) => {
                    set.push("category = ").push_bind_unseparated(v.as_str());
                }
                Patch::Clear => {
                    set.push("category = NULL");
                }
                Patch::Keep => {}
            }
            match &patch.scores {
                Patch::Set(s) => {
                    set.push("score_relevance = ").push_bind_unseparated(s.relevance);
                    set.push("score_quality = ").push_bind_unseparated(s.quality);
                    set.push("score_timeliness = ").push_bind_unseparated(s.timeliness);
                }
                Patch::Clear => {
                    set.push("score_relevance = NULL");
                    set.push("score_quality = NULL");
                    set.push("score_timeliness = NULL");
                }
                Patch::Keep => {}
            }
            match &patch.keywords {
                Patch::Set(v) => {
                    let json = serde_json::to_string(v)
                        .map_err(|e| PipelineError::Validation(e.to_string()))?;
                    set.push("keywords = ").push_bind_unseparated(json);
                }
                Patch::Clear => {
                    set.push("keywords = '[]'");
                }
                Patch::Keep => {}
            }
        }
        qb.push(" WHERE id = ").push_bind(id);

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let affected = qb.build().execute(&mut *tx).await?.rows_affected();
        if affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        reindex(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Delete an item by URL and retract it from the index. Returns whether a row was removed.
    pub async fn delete(&self, url: &str) -> PipelineResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction never upgrades from a read snapshot.
        let id: Option<i64> = sqlx::query_scalar("DELETE FROM items WHERE url = ? RETURNING id")
            .bind(url)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(id) = id else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query("DELETE FROM items_fts WHERE rowid = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Dedup check by URL, served by the unique index.
    pub async fn exists(&self, url: &str) -> PipelineResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM items WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn exists_id(&self, id: i64) -> PipelineResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn id_for_url(&self, url: &str) -> PipelineResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM items WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get(&self, url: &str) -> PipelineResult<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {} FROM items WHERE url = ?", ITEM_COLUMNS))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    pub async fn get_by_id(&self, id: i64) -> PipelineResult<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Ids of items awaiting enrichment (no summary), oldest first. `force` selects every item.
    pub async fn pending_enrichment(
        &self,
        force: bool,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<i64>> {
        let sql = if force {
            "SELECT id FROM items ORDER BY id ASC LIMIT ?"
        } else {
            "SELECT id FROM items WHERE summary IS NULL OR summary = '' ORDER BY id ASC LIMIT ?"
        };
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let ids = sqlx::query_scalar(sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Run a ranked, filtered, paged search.
    pub async fn search(&self, request: &SearchRequest) -> PipelineResult<SearchPage> {
        let match_expr = search::to_fts_query(&request.query)?;
        let has_text = match_expr.is_some();

        let mut count_qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM items");
        push_from_and_where(&mut count_qb, match_expr.as_deref(), request);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(ITEM_COLUMNS);
        if has_text {
            qb.push(
                ", -bm25(items_fts, 10.0, 4.0, 1.0, 6.0) AS text_score, \
                 snippet(items_fts, 2, '[', ']', '...', 24) AS snippet",
            );
        } else {
            qb.push(", 0.0 AS text_score, NULL AS snippet");
        }
        qb.push(" FROM items");
        push_from_and_where(&mut qb, match_expr.as_deref(), request);

        qb.push(" ORDER BY ");
        qb.push(match request.sort {
            SortMode::Relevance if has_text => "text_score DESC, items.id DESC",
            SortMode::Relevance | SortMode::Recency => {
                "COALESCE(items.published, items.downloaded) DESC, items.id DESC"
            }
            SortMode::Score => {
                "COALESCE(items.score_relevance, 0) DESC, COALESCE(items.score_quality, 0) DESC, \
                 COALESCE(items.score_timeliness, 0) DESC, items.id ASC"
            }
            SortMode::Source => {
                "items.source_name COLLATE NOCASE ASC, \
                 COALESCE(items.published, items.downloaded) DESC, items.id DESC"
            }
        });
        qb.push(" LIMIT ")
            .push_bind(request.page_size as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            hits.push(SearchHit {
                item: item_from_row(row)?,
                text_score: row.try_get("text_score")?,
                snippet: row.try_get("snippet")?,
            });
        }

        Ok(SearchPage {
            hits,
            page: request.page,
            page_size: request.page_size,
            total,
        })
    }

    /// Aggregate counts over items and the failure ledger.
    pub async fn stats(&self) -> PipelineResult<StoreStats> {
        let total_items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        let with_summary: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM items WHERE summary IS NOT NULL AND summary != ''",
        )
        .fetch_one(&self.pool)
        .await?;
        let last_downloaded: Option<i64> = sqlx::query_scalar("SELECT MAX(downloaded) FROM items")
            .fetch_one(&self.pool)
            .await?;

        let by_source = grouped_counts(
            &self.pool,
            "SELECT source_name, COUNT(*) AS n FROM items GROUP BY source_name ORDER BY n DESC, source_name ASC",
        )
        .await?;
        let by_category = grouped_counts(
            &self.pool,
            "SELECT COALESCE(category, 'unclassified'), COUNT(*) AS n FROM items GROUP BY 1 ORDER BY n DESC, 1 ASC",
        )
        .await?;
        let failures = grouped_counts(
            &self.pool,
            "SELECT category, COUNT(*) AS n FROM failures GROUP BY category ORDER BY category ASC",
        )
        .await?;

        Ok(StoreStats {
            total_items,
            with_summary,
            without_summary: total_items - with_summary,
            by_source,
            by_category,
            failures,
            last_downloaded,
        })
    }
}

fn required_field(name: &str) -> PipelineError {
    PipelineError::Validation(format!("{} cannot be cleared", name))
}

/// Replace the index entry for `id` with the row's current text, inside `tx`.
async fn reindex(conn: &mut SqliteConnection, id: i64) -> PipelineResult<()> {
    sqlx::query("DELETE FROM items_fts WHERE rowid = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let row = sqlx::query("SELECT title, summary, body, keywords FROM items WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

    let keywords: String = row.try_get("keywords")?;
    let keywords = parse_keywords(&keywords).join(" ");
    let summary: Option<String> = row.try_get("summary")?;

    sqlx::query("INSERT INTO items_fts (rowid, title, summary, body, keywords) VALUES (?, ?, ?, ?, ?)")
        .bind(id)
        .bind(row.try_get::<String, _>("title")?)
        .bind(summary.unwrap_or_default())
        .bind(row.try_get::<String, _>("body")?)
        .bind(keywords)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn push_from_and_where<'a>(
    qb: &mut QueryBuilder<'a, Sqlite>,
    match_expr: Option<&str>,
    request: &'a SearchRequest,
) {
    if match_expr.is_some() {
        qb.push(" JOIN items_fts ON items_fts.rowid = items.id");
    }
    qb.push(" WHERE 1 = 1");
    if let Some(expr) = match_expr {
        qb.push(" AND items_fts MATCH ").push_bind(expr.to_string());
    }
    let filters = &request.filters;
    if let Some(category) = filters.category {
        qb.push(" AND items.category = ").push_bind(category.as_str());
    }
    if let Some(ref source) = filters.source_name {
        qb.push(" AND items.source_name = ").push_bind(source.as_str());
    }
    if let Some(since) = filters.since {
        qb.push(" AND COALESCE(items.published, items.downloaded) >= ")
            .push_bind(since.timestamp());
    }
    if let Some(until) = filters.until {
        qb.push(" AND COALESCE(items.published, items.downloaded) <= ")
            .push_bind(until.timestamp());
    }
}

async fn grouped_counts(pool: &SqlitePool, sql: &str) -> PipelineResult<Vec<(String, i64)>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    rows.iter()
        .map(|row| -> PipelineResult<(String, i64)> { Ok((row.try_get(0)?, row.try_get(1)?)) })
        .collect()
}

fn parse_keywords(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

fn ts(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn item_from_row(row: &SqliteRow) -> PipelineResult<Item> {
    let relevance: Option<i64> = row.try_get("score_relevance")?;
    let quality: Option<i64> = row.try_get("score_quality")?;
    let timeliness: Option<i64> = row.try_get("score_timeliness")?;
    let scores = match (relevance, quality, timeliness) {
        (Some(relevance), Some(quality), Some(timeliness)) => Some(Scores {
            relevance,
            quality,
            timeliness,
        }),
        _ => None,
    };

    let category: Option<String> = row.try_get("category")?;
    let published: Option<i64> = row.try_get("published")?;
    let downloaded: i64 = row.try_get("downloaded")?;
    let keywords: String = row.try_get("keywords")?;

    Ok(Item {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        source_name: row.try_get("source_name")?,
        origin_url: row.try_get("origin_url")?,
        published: published.and_then(ts),
        downloaded: ts(downloaded).unwrap_or_default(),
        content_source: row.try_get("content_source")?,
        body: row.try_get("body")?,
        summary: row.try_get("summary")?,
        category: category.as_deref().map(Category::from_label),
        scores,
        keywords: parse_keywords(&keywords),
        checksum: row.try_get("checksum")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use chrono::TimeZone;

    async fn store() -> ItemStore {
        let pool = db::connect_in_memory().await.unwrap();
        migrate::apply(&pool).await.unwrap();
        ItemStore::new(pool)
    }

    fn new_item(url: &str, title: &str, body: &str) -> NewItem {
        NewItem {
            url: url.to_string(),
            title: title.to_string(),
            source_name: "Example Feed".to_string(),
            origin_url: Some("https://example.com/feed.xml".to_string()),
            published: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            downloaded: Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap(),
            content_source: "page".to_string(),
            body: body.to_string(),
        }
    }

    fn scored(relevance: i64, quality: i64, timeliness: i64) -> ItemPatch {
        ItemPatch {
            scores: Patch::Set(Scores {
                relevance,
                quality,
                timeliness,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_then_exists_and_duplicate_conflicts() {
        let store = store().await;
        let item = new_item("https://example.com/a", "Alpha", "alpha body");

        assert!(!store.exists(&item.url).await.unwrap());
        store.insert(&item).await.unwrap();
        assert!(store.exists(&item.url).await.unwrap());

        match store.insert(&item).await {
            Err(PipelineError::Conflict { url }) => assert_eq!(url, item.url),
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn update_applies_only_supplied_fields() {
        let store = store().await;
        let id = store
            .insert(&new_item("https://example.com/a", "Alpha", "alpha body"))
            .await
            .unwrap();

        let patch = ItemPatch {
            summary: Patch::Set("short summary".to_string()),
            category: Patch::Set(Category::Tools),
            keywords: Patch::Set(vec!["compilers".to_string(), "linkers".to_string()]),
            ..Default::default()
        };
        assert!(store.update(id, &patch).await.unwrap());

        let item = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(item.title, "Alpha");
        assert_eq!(item.body, "alpha body");
        assert_eq!(item.summary.as_deref(), Some("short summary"));
        assert_eq!(item.category, Some(Category::Tools));
        assert_eq!(item.keywords, vec!["compilers", "linkers"]);
        assert!(item.published.is_some());

        // Keep leaves the summary alone; Clear is the only way to null it
        store.update(id, &scored(5, 5, 5)).await.unwrap();
        let item = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(item.summary.as_deref(), Some("short summary"));

        let clear = ItemPatch {
            summary: Patch::Clear,
            ..Default::default()
        };
        store.update(id, &clear).await.unwrap();
        let item = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(item.summary, None);

        assert!(!store.update(9999, &clear).await.unwrap());
    }

    #[tokio::test]
    async fn body_update_refreshes_checksum_and_index() {
        let store = store().await;
        let id = store
            .insert(&new_item("https://example.com/a", "Alpha", "original words"))
            .await
            .unwrap();
        let before = store.get_by_id(id).await.unwrap().unwrap().checksum;

        let patch = ItemPatch {
            body: Patch::Set("replacement paragraph about lighthouses".to_string()),
            ..Default::default()
        };
        store.update(id, &patch).await.unwrap();

        let after = store.get_by_id(id).await.unwrap().unwrap().checksum;
        assert_ne!(before, after);

        let old = store.search(&SearchRequest::new("original")).await.unwrap();
        assert_eq!(old.total, 0);
        let new = store.search(&SearchRequest::new("lighthouses")).await.unwrap();
        assert_eq!(new.total, 1);
    }

    #[tokio::test]
    async fn clearing_required_field_is_rejected() {
        let store = store().await;
        let id = store
            .insert(&new_item("https://example.com/a", "Alpha", "body"))
            .await
            .unwrap();
        let patch = ItemPatch {
            title: Patch::Clear,
            ..Default::default()
        };
        assert!(matches!(
            store.update(id, &patch).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn deleted_items_never_match_again() {
        let store = store().await;
        for (i, body) in ["rust borrow checker", "rust async runtime", "go channels"]
            .iter()
            .enumerate()
        {
            store
                .insert(&new_item(&format!("https://example.com/{}", i), "Post", body))
                .await
                .unwrap();
        }

        let request = SearchRequest::new("rust");
        let page = store.search(&request).await.unwrap();
        assert_eq!(page.total, 2);

        for hit in &page.hits {
            assert!(store.delete(&hit.item.url).await.unwrap());
        }
        let page = store.search(&request).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.hits.is_empty());

        let other = store.search(&SearchRequest::new("channels")).await.unwrap();
        assert_eq!(other.total, 1);
        assert!(!store.delete("https://example.com/missing").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deletes_succeed_alongside_ledger_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = crate::config::Config::minimal(tmp.path().join("fh.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        let store = ItemStore::new(pool.clone());
        for i in 0..100 {
            let url = format!("https://example.com/{}", i);
            store.insert(&new_item(&url, "Title", "body text")).await.unwrap();
        }

        let ledger = crate::ledger::FailureLedger::new(pool.clone(), &config.ledger);
        let writer = tokio::spawn(async move {
            for i in 0..1000 {
                let url = format!("https://example.org/{}", i % 25);
                ledger
                    .record(crate::models::FailureCategory::ItemFetch, &url, None, "HTTP 500")
                    .await
                    .unwrap();
            }
        });

        let mut deletes = tokio::task::JoinSet::new();
        for i in 0..100 {
            let store = store.clone();
            deletes.spawn(async move { store.delete(&format!("https://example.com/{}", i)).await });
        }
        while let Some(joined) = deletes.join_next().await {
            assert!(joined.unwrap().unwrap());
        }
        writer.await.unwrap();

        let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&pool)
            .await
            .unwrap();
        let indexed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items_fts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!((items, indexed), (0, 0));
    }

    #[tokio::test]
    async fn score_sort_orders_tuples_and_treats_missing_as_zero() {
        let store = store().await;
        let cases = [
            ("https://example.com/a", Some((9, 5, 5))),
            ("https://example.com/b", Some((9, 5, 8))),
            ("https://example.com/c", Some((3, 9, 9))),
            ("https://example.com/d", None),
        ];
        for (url, scores) in cases {
            let id = store.insert(&new_item(url, "Post", "text")).await.unwrap();
            if let Some((r, q, t)) = scores {
                store.update(id, &scored(r, q, t)).await.unwrap();
            }
        }

        let request = SearchRequest {
            sort: SortMode::Score,
            ..Default::default()
        };
        let page = store.search(&request).await.unwrap();
        let urls: Vec<&str> = page.hits.iter().map(|h| h.item.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/b",
                "https://example.com/a",
                "https://example.com/c",
                "https://example.com/d",
            ]
        );
    }

    #[tokio::test]
    async fn query_language_and_filters() {
        let store = store().await;
        store
            .insert(&new_item("https://example.com/1", "Memory safety in Rust", "ownership"))
            .await
            .unwrap();
        store
            .insert(&new_item("https://example.com/2", "Safety of memory", "garbage collection"))
            .await
            .unwrap();
        let id3 = store
            .insert(&new_item("https://example.com/3", "Go memory model", "channels"))
            .await
            .unwrap();
        store
            .update(
                id3,
                &ItemPatch {
                    category: Patch::Set(Category::Engineering),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let phrase = store
            .search(&SearchRequest::new("\"memory safety\""))
            .await
            .unwrap();
        assert_eq!(phrase.total, 1);
        assert_eq!(phrase.hits[0].item.url, "https://example.com/1");

        let negated = store.search(&SearchRequest::new("memory -go")).await.unwrap();
        assert_eq!(negated.total, 2);

        let either = store
            .search(&SearchRequest::new("ownership OR channels"))
            .await
            .unwrap();
        assert_eq!(either.total, 2);

        let mut filtered = SearchRequest::new("memory");
        filtered.filters.category = Some(Category::Engineering);
        let page = store.search(&filtered).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.hits[0].item.id, id3);
    }

    #[tokio::test]
    async fn paging_and_date_range() {
        let store = store().await;
        for day in 1..=5u32 {
            let mut item = new_item(&format!("https://example.com/{}", day), "Daily", "news");
            item.published = Some(Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).unwrap());
            store.insert(&item).await.unwrap();
        }

        let mut request = SearchRequest {
            page: 2,
            page_size: 2,
            ..Default::default()
        };
        let page = store.search(&request).await.unwrap();
        assert_eq!(page.total, 5);
        let urls: Vec<&str> = page.hits.iter().map(|h| h.item.url.as_str()).collect();
        assert_eq!(urls, vec!["https://example.com/3", "https://example.com/2"]);

        request.page = 1;
        request.page_size = 20;
        request.filters.since = Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        request.filters.until = Some(Utc.with_ymd_and_hms(2024, 5, 3, 23, 59, 59).unwrap());
        assert_eq!(store.search(&request).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn stats_counts_summaries_sources_and_categories() {
        let store = store().await;
        let id = store
            .insert(&new_item("https://example.com/a", "A", "x"))
            .await
            .unwrap();
        store
            .insert(&new_item("https://example.com/b", "B", "y"))
            .await
            .unwrap();
        store
            .update(
                id,
                &ItemPatch {
                    summary: Patch::Set("s".to_string()),
                    category: Patch::Set(Category::Security),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.with_summary, 1);
        assert_eq!(stats.without_summary, 1);
        assert_eq!(stats.by_source, vec![("Example Feed".to_string(), 2)]);
        assert!(stats.by_category.contains(&("security".to_string(), 1)));
        assert_eq!(stats.total_failures(), 0);

        let pending = store.pending_enrichment(false, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(store.pending_enrichment(true, Some(1)).await.unwrap().len(), 1);
    }
}
