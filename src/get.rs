//! Item retrieval and deletion by URL.
//!
//! Used by the `fh get` / `fh delete` CLI commands and `GET /items?url=`.
//! Deletion is an administrative action: it removes the row and its index
//! entry in one transaction.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::models::Item;
use crate::store::ItemStore;

/// Item response shape shared by the CLI and the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResponse {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub source_name: String,
    pub origin_url: Option<String>,
    pub published: Option<String>, // ISO8601
    pub downloaded: String,        // ISO8601
    pub content_source: String,
    pub summary: Option<String>,
    pub category: Option<String>,
    pub scores: Option<crate::models::Scores>,
    pub keywords: Vec<String>,
    pub checksum: String,
    pub body: String,
}

impl From<Item> for ItemResponse {
    fn from(item: Item) -> Self {
        Self {
            id: item.id,
            url: item.url,
            title: item.title,
            source_name: item.source_name,
            origin_url: item.origin_url,
            published: item.published.map(|p| format_ts_iso(p.timestamp())),
            downloaded: format_ts_iso(item.downloaded.timestamp()),
            content_source: item.content_source,
            summary: item.summary,
            category: item.category.map(|c| c.to_string()),
            scores: item.scores,
            keywords: item.keywords,
            checksum: item.checksum,
            body: item.body,
        }
    }
}

/// Look up one item by URL (used by CLI and server).
pub async fn get_item(store: &ItemStore, url: &str) -> Result<Option<ItemResponse>> {
    Ok(store.get(url).await?.map(ItemResponse::from))
}

/// CLI entry point: print the item to stdout.
pub async fn run_get(config: &Config, url: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let item = get_item(&ItemStore::new(pool.clone()), url).await;
    pool.close().await;

    let Some(item) = item? else {
        bail!("item not found: {}", url);
    };

    println!("--- Item ---");
    println!("id:             {}", item.id);
    println!("title:          {}", item.title);
    println!("url:            {}", item.url);
    println!("source:         {}", item.source_name);
    if let Some(ref origin) = item.origin_url {
        println!("origin:         {}", origin);
    }
    println!(
        "published:      {}",
        item.published.as_deref().unwrap_or("(unknown)")
    );
    println!("downloaded:     {}", item.downloaded);
    println!("content_source: {}", item.content_source);
    println!("checksum:       {}", item.checksum);
    if let Some(ref category) = item.category {
        println!("category:       {}", category);
    }
    if let Some(ref s) = item.scores {
        println!(
            "scores:         relevance {} / quality {} / timeliness {}",
            s.relevance, s.quality, s.timeliness
        );
    }
    if !item.keywords.is_empty() {
        println!("keywords:       {}", item.keywords.join(", "));
    }
    println!();

    if let Some(ref summary) = item.summary {
        println!("--- Summary ---");
        println!("{}", summary);
        println!();
    }

    println!("--- Body ---");
    println!("{}", item.body);

    Ok(())
}

/// CLI entry point for `fh delete`.
pub async fn run_delete(config: &Config, url: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let deleted = ItemStore::new(pool.clone()).delete(url).await;
    pool.close().await;

    if !deleted? {
        bail!("item not found: {}", url);
    }
    println!("deleted {}", url);
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
