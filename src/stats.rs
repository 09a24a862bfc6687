//! Store statistics overview.
//!
//! Summarizes what the store holds: item counts, enrichment coverage,
//! per-source and per-category breakdowns, and failure ledger totals.
//! Used by `fh stats`.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::store::ItemStore;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = ItemStore::new(pool.clone()).stats().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Feed Harness: Store Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Items:       {}", stats.total_items);
    println!(
        "  Enriched:    {} / {} ({}%)",
        stats.with_summary,
        stats.total_items,
        if stats.total_items > 0 {
            (stats.with_summary * 100) / stats.total_items
        } else {
            0
        }
    );
    println!(
        "  Last item:   {}",
        match stats.last_downloaded {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        }
    );

    if !stats.by_source.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<40} {:>8}", "SOURCE", "ITEMS");
        println!("  {}", "-".repeat(49));
        for (source, count) in &stats.by_source {
            println!("  {:<40} {:>8}", source, count);
        }
    }

    if !stats.by_category.is_empty() {
        println!();
        println!("  By category:");
        for (category, count) in &stats.by_category {
            println!("  {:<40} {:>8}", category, count);
        }
    }

    println!();
    println!("  Failures:    {}", stats.total_failures());
    for (category, count) in &stats.failures {
        println!("    {:<16} {}", category, count);
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now, e.g. "3 hours ago".
pub fn format_ts_relative(ts: i64) -> String {
    format_ts_relative_at(ts, chrono::Utc::now().timestamp())
}

fn format_ts_relative_at(ts: i64, now: i64) -> String {
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_timestamps() {
        let now = 1_700_000_000;
        assert_eq!(format_ts_relative_at(now - 10, now), "just now");
        assert_eq!(format_ts_relative_at(now - 60, now), "1 min ago");
        assert_eq!(format_ts_relative_at(now - 7200, now), "2 hours ago");
        assert_eq!(format_ts_relative_at(now - 86400 * 3, now), "3 days ago");
        assert_eq!(format_ts_relative_at(now - 86400 * 40, now), format_ts_iso(now - 86400 * 40));
    }
}
