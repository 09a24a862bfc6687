//! # Feed Harness CLI (`fh`)
//!
//! The `fh` binary is the primary interface for Feed Harness. It provides
//! commands for database initialization, feed ingestion, enrichment, search,
//! item retrieval, operational reports, and starting the read API.
//!
//! ## Usage
//!
//! ```bash
//! fh --config ./config/fh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fh init` | Create the SQLite database and run schema migrations |
//! | `fh ingest` | Fetch new items from origins (`--opml` or `--origin`) |
//! | `fh enrich` | Summarize, classify and score items lacking a summary |
//! | `fh search "<query>"` | Search stored items |
//! | `fh get <url>` | Print one item |
//! | `fh delete <url>` | Remove one item and its index entry |
//! | `fh stats` | Store statistics |
//! | `fh failures` | Failure ledger, optionally as an OPML report |
//! | `fh health` | JSON health report (exit code 1 when unhealthy) |
//! | `fh clean-cache` | Purge old enrichment cache entries |
//! | `fh serve` | Start the read-only HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest from a subscription list
//! fh ingest --opml ./feeds.opml
//!
//! # Ingest a single origin
//! fh ingest --origin "This Week in Rust=https://this-week-in-rust.org/rss.xml"
//!
//! # Best-scored security items from January
//! fh search "" --category security --since 2024-01-01 --until 2024-01-31 --sort score
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use feed_harness::models::{Category, FailureCategory, Origin};
use feed_harness::progress::ProgressMode;
use feed_harness::search::{parse_date_bound, SearchFilters, SearchRequest, SortMode};
use feed_harness::{
    cache, config, enrich_cmd, get, health, ingest, logging, migrate, opml, search, server, stats,
};

/// Feed Harness CLI: resilient feed ingestion and enrichment with a
/// searchable local store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/fh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fh",
    about = "Feed Harness: resilient feed ingestion and enrichment with a searchable local store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fh.toml")]
    config: PathBuf,

    /// Log output format (stderr). Filter with RUST_LOG.
    #[arg(long, global = true, value_enum, default_value_t = logging::LogFormat::Pretty)]
    log_format: logging::LogFormat,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This command
    /// is idempotent; running it multiple times is safe.
    Init,

    /// Fetch new items from origins.
    ///
    /// Items already stored (by URL) are skipped before any network call.
    /// Ctrl-C stops admitting new fetches; in-flight work gets a grace period.
    Ingest {
        /// OPML subscription list to read origins from.
        #[arg(long)]
        opml: Option<PathBuf>,

        /// Additional origin as `NAME=URL`. Repeatable.
        #[arg(long = "origin", value_parser = parse_origin)]
        origins: Vec<Origin>,

        /// Re-fetch stored items and update them in place; ignore item backoff.
        #[arg(long)]
        force: bool,
    },

    /// Enrich items lacking a summary.
    Enrich {
        /// Re-enrich every item and ignore enrichment backoff.
        #[arg(long)]
        force: bool,

        /// Maximum number of items to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search stored items.
    Search {
        /// Query: terms are ANDed, "quoted phrases", `a OR b`, `-excluded`.
        query: String,

        /// Only items in this category.
        #[arg(long)]
        category: Option<Category>,

        /// Only items from this source name.
        #[arg(long)]
        source: Option<String>,

        /// Published on or after (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        /// Published on or before (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        until: Option<String>,

        /// Ordering: recency, score, source, or relevance.
        #[arg(long, default_value = "recency")]
        sort: SortMode,

        /// Page number (1-based).
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Results per page (1-200).
        #[arg(long, default_value_t = search::DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },

    /// Print one item by URL.
    Get {
        url: String,
    },

    /// Delete one item by URL, including its index entry.
    Delete {
        url: String,
    },

    /// Show store statistics.
    Stats,

    /// List the failure ledger.
    Failures {
        /// Only this category: origin_fetch, item_fetch, or enrichment.
        #[arg(long)]
        category: Option<FailureCategory>,

        /// Also write failing origins as OPML to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print a JSON health report. Exits with code 1 when unhealthy.
    Health,

    /// Purge enrichment cache entries older than N days.
    CleanCache {
        /// Age threshold in days (default: `enrichment.cache_max_age_days`).
        #[arg(long)]
        days: Option<i64>,

        /// Report what would be removed without deleting.
        #[arg(long)]
        dry_run: bool,
    },

    /// Start the read-only HTTP API on `[server].bind`.
    Serve,
}

/// Parse a `NAME=URL` pair for `--origin`.
fn parse_origin(s: &str) -> Result<Origin, String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid NAME=URL: no '=' found in '{}'", s))?;
    let (name, url) = (s[..pos].trim(), s[pos + 1..].trim());
    if name.is_empty() || url.is_empty() {
        return Err(format!("invalid NAME=URL: '{}'", s));
    }
    Ok(Origin::new(name, url))
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::warn!("shutdown requested, finishing in-flight work");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            opml: opml_path,
            origins,
            force,
        } => {
            let mut all = match opml_path {
                Some(path) => opml::load_opml(&path)?,
                None => Vec::new(),
            };
            all.extend(origins);

            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());
            ingest::run_ingest(&cfg, all, force, progress, cancel).await?;
        }
        Commands::Enrich { force, limit } => {
            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());
            enrich_cmd::run_enrich(&cfg, force, limit, progress, cancel).await?;
        }
        Commands::Search {
            query,
            category,
            source,
            since,
            until,
            sort,
            page,
            page_size,
        } => {
            let request = SearchRequest {
                query,
                filters: SearchFilters {
                    category,
                    source_name: source,
                    since: since.as_deref().map(|s| parse_date_bound(s, false)).transpose()?,
                    until: until.as_deref().map(|s| parse_date_bound(s, true)).transpose()?,
                },
                sort,
                page,
                page_size,
            };
            search::run_search(&cfg, request).await?;
        }
        Commands::Get { url } => {
            get::run_get(&cfg, &url).await?;
        }
        Commands::Delete { url } => {
            get::run_delete(&cfg, &url).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Failures { category, output } => {
            opml::run_failures(&cfg, category, output.as_deref()).await?;
        }
        Commands::Health => {
            if !health::run_health(&cfg).await? {
                std::process::exit(1);
            }
        }
        Commands::CleanCache { days, dry_run } => {
            cache::run_clean_cache(&cfg, days, dry_run).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_arg_splits_on_first_equals() {
        let origin = parse_origin("Blog = https://example.com/feed?a=b").unwrap();
        assert_eq!(origin.name, "Blog");
        assert_eq!(origin.url, "https://example.com/feed?a=b");
        assert!(parse_origin("no-equals").is_err());
        assert!(parse_origin("=https://x").is_err());
    }

    #[test]
    fn cli_parses_search_flags() {
        let cli = Cli::try_parse_from([
            "fh", "search", "rust", "--category", "security", "--sort", "score", "--page", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Search {
                category, sort, page, ..
            } => {
                assert_eq!(category, Some(Category::Security));
                assert_eq!(sort, SortMode::Score);
                assert_eq!(page, 2);
            }
            _ => panic!("expected search"),
        }
    }
}
