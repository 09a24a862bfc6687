//! Ingestion coordinator.
//!
//! Walks the origin list with two levels of bounded concurrency: up to
//! `download.concurrent_origins` origins are in flight at once, and within
//! each origin up to `download.concurrent_items` item fetches. Per origin:
//!
//! 1. skip when the origin's failure ledger entry is still backing off;
//! 2. throttle, then fetch the listing with stored validators attached
//!    (`304` ends the origin with success);
//! 3. on success clear the ledger entry, store the new validator, parse;
//! 4. per listed item, dedup against the store before any network call,
//!    then throttle, fetch, extract and insert.
//!
//! Per-item and per-origin failures are recorded in the ledger and never
//! abort the run. Cancellation stops admitting new origins and items at
//! once; in-flight work gets `download.shutdown_grace_secs` before it is
//! abandoned. Every store write is a single transaction, so abandoning a
//! task never leaves a partial row.

use anyhow::Result;
use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::extract::{html_to_text, ContentExtractor, HtmlExtractor};
use crate::feed::{parse_listing, ListingEntry};
use crate::fetch::{FetchOutcome, Fetcher};
use crate::ledger::FailureLedger;
use crate::metrics::{FETCH_FAILURES, ITEMS_STORED, ITEMS_UPDATED};
use crate::models::{FailureCategory, ItemPatch, NewItem, Origin, Patch};
use crate::progress::{NoProgress, ProgressEvent, ProgressMode, ProgressReporter};
use crate::store::ItemStore;
use crate::throttle::OriginThrottle;
use crate::validators::ConditionalFetchCache;

/// Outcome counts for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub origins_total: u64,
    pub origins_fetched: u64,
    pub origins_not_modified: u64,
    pub origins_backing_off: u64,
    pub origins_failed: u64,
    pub items_inserted: u64,
    pub items_updated: u64,
    pub items_existing: u64,
    pub items_backing_off: u64,
    pub items_failed: u64,
    pub cancelled: bool,
}

#[derive(Default)]
struct Counters {
    origins_done: AtomicU64,
    origins_fetched: AtomicU64,
    origins_not_modified: AtomicU64,
    origins_backing_off: AtomicU64,
    origins_failed: AtomicU64,
    items_inserted: AtomicU64,
    items_updated: AtomicU64,
    items_existing: AtomicU64,
    items_backing_off: AtomicU64,
    items_failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

enum ItemOutcome {
    Inserted,
    Updated,
    Existing,
    BackingOff,
    Failed,
}

pub struct IngestionCoordinator {
    store: ItemStore,
    ledger: FailureLedger,
    validators: ConditionalFetchCache,
    throttle: OriginThrottle,
    fetcher: Fetcher,
    extractor: Arc<dyn ContentExtractor>,
    concurrent_origins: usize,
    concurrent_items: usize,
    grace: Duration,
    evict_every: Duration,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
}

impl IngestionCoordinator {
    pub fn new(
        config: &Config,
        pool: SqlitePool,
        extractor: Arc<dyn ContentExtractor>,
    ) -> PipelineResult<Self> {
        Ok(Self {
            store: ItemStore::new(pool.clone()),
            ledger: FailureLedger::new(pool.clone(), &config.ledger),
            validators: ConditionalFetchCache::new(pool, config.download.validator_max_age_days),
            throttle: OriginThrottle::new(&config.throttle),
            fetcher: Fetcher::new(&config.download)?,
            extractor,
            concurrent_origins: config.download.concurrent_origins.max(1),
            concurrent_items: config.download.concurrent_items.max(1),
            grace: Duration::from_secs(config.download.shutdown_grace_secs),
            evict_every: Duration::from_secs(config.throttle.idle_evict_secs.max(1)),
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Ingest every origin once. `force` re-fetches stored items and updates them in place.
    pub async fn run(self: Arc<Self>, origins: Vec<Origin>, force: bool) -> IngestReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("ingest", run_id = %run_id);
        self.run_inner(origins, force).instrument(span).await
    }

    async fn run_inner(self: Arc<Self>, origins: Vec<Origin>, force: bool) -> IngestReport {
        let total = origins.len() as u64;
        tracing::info!(origins = total, force, "ingestion started");

        let counters = Arc::new(Counters::default());
        let slots = Arc::new(Semaphore::new(self.concurrent_origins));
        let evictor = self.spawn_evictor();
        let mut tasks = JoinSet::new();

        for origin in origins {
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let this = Arc::clone(&self);
            let counters = Arc::clone(&counters);
            tasks.spawn(async move {
                let _permit = permit;
                this.process_origin(&origin, force, &counters).await;
                let done = counters.origins_done.fetch_add(1, Ordering::Relaxed) + 1;
                this.progress.report(ProgressEvent::Ingesting { done, total });
            });
        }

        let abandoned = self.drain(&mut tasks).await;
        evictor.abort();

        let report = IngestReport {
            origins_total: total,
            origins_fetched: counters.origins_fetched.load(Ordering::Relaxed),
            origins_not_modified: counters.origins_not_modified.load(Ordering::Relaxed),
            origins_backing_off: counters.origins_backing_off.load(Ordering::Relaxed),
            origins_failed: counters.origins_failed.load(Ordering::Relaxed),
            items_inserted: counters.items_inserted.load(Ordering::Relaxed),
            items_updated: counters.items_updated.load(Ordering::Relaxed),
            items_existing: counters.items_existing.load(Ordering::Relaxed),
            items_backing_off: counters.items_backing_off.load(Ordering::Relaxed),
            items_failed: counters.items_failed.load(Ordering::Relaxed),
            cancelled: self.cancel.is_cancelled(),
        };

        tracing::info!(
            inserted = report.items_inserted,
            updated = report.items_updated,
            existing = report.items_existing,
            item_failures = report.items_failed,
            origin_failures = report.origins_failed,
            abandoned,
            cancelled = report.cancelled,
            "ingestion finished"
        );
        report
    }

    /// Wait for all tasks. After cancellation, wait at most the grace period, then abort.
    /// Returns the number of tasks abandoned.
    async fn drain(&self, tasks: &mut JoinSet<()>) -> usize {
        let finished = tokio::select! {
            _ = async {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "ingestion task panicked");
                    }
                }
            } => true,
            _ = async {
                self.cancel.cancelled().await;
                tokio::time::sleep(self.grace).await;
            } => false,
        };

        if finished {
            return 0;
        }
        let abandoned = tasks.len();
        tracing::warn!(abandoned, grace_secs = self.grace.as_secs(), "grace period elapsed, abandoning in-flight work");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        abandoned
    }

    fn spawn_evictor(&self) -> tokio::task::JoinHandle<()> {
        let throttle = self.throttle.clone();
        let every = self.evict_every;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = throttle.evict_idle();
                if evicted > 0 {
                    tracing::debug!(evicted, tracked = throttle.tracked_origins(), "evicted idle origin buckets");
                }
            }
        })
    }

    async fn process_origin(self: &Arc<Self>, origin: &Origin, force: bool, counters: &Arc<Counters>) {
        let span = tracing::info_span!("origin", origin = %origin.name);
        let result = self
            .ingest_origin(origin, force, counters)
            .instrument(span)
            .await;
        if let Err(e) = result {
            bump(&counters.origins_failed);
            tracing::error!(origin = %origin.name, url = %origin.url, error = %e, "origin aborted by store error");
        }
    }

    async fn ingest_origin(
        self: &Arc<Self>,
        origin: &Origin,
        force: bool,
        counters: &Arc<Counters>,
    ) -> PipelineResult<()> {
        if !self.ledger.is_eligible(FailureCategory::OriginFetch, &origin.url).await? {
            tracing::info!(url = %origin.url, "origin backing off, skipped");
            bump(&counters.origins_backing_off);
            return Ok(());
        }

        // Forced runs need the full listing to reach stored items.
        let validator = if force {
            None
        } else {
            self.validators.get(&origin.url).await?
        };
        self.throttle.acquire(&origin.url).await;
        let resource = match self.fetcher.fetch(&origin.url, validator.as_ref()).await {
            Ok(FetchOutcome::NotModified) => {
                tracing::info!(url = %origin.url, "listing not modified");
                bump(&counters.origins_not_modified);
                return Ok(());
            }
            Ok(FetchOutcome::Fetched(resource)) => resource,
            Err(e) => {
                self.record_origin_failure(origin, &e, counters).await?;
                return Ok(());
            }
        };

        let entries = match parse_listing(&resource.body) {
            Ok(entries) => entries,
            Err(e) => {
                self.record_origin_failure(origin, &e, counters).await?;
                return Ok(());
            }
        };

        self.ledger.clear(FailureCategory::OriginFetch, &origin.url).await?;
        self.validators.put(&origin.url, &resource.validator).await?;
        bump(&counters.origins_fetched);
        tracing::info!(url = %origin.url, entries = entries.len(), "listing fetched");

        let slots = Arc::new(Semaphore::new(self.concurrent_items));
        let mut tasks = JoinSet::new();
        for entry in entries {
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let this = Arc::clone(self);
            let origin = origin.clone();
            let counters = Arc::clone(counters);
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = match this.ingest_item(&origin, &entry, force).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(url = %entry.link, error = %e, "item aborted by store error");
                        ItemOutcome::Failed
                    }
                };
                bump(match outcome {
                    ItemOutcome::Inserted => &counters.items_inserted,
                    ItemOutcome::Updated => &counters.items_updated,
                    ItemOutcome::Existing => &counters.items_existing,
                    ItemOutcome::BackingOff => &counters.items_backing_off,
                    ItemOutcome::Failed => &counters.items_failed,
                });
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "item task panicked");
            }
        }
        Ok(())
    }

    async fn record_origin_failure(
        &self,
        origin: &Origin,
        error: &PipelineError,
        counters: &Counters,
    ) -> PipelineResult<()> {
        let retries = self
            .ledger
            .record(
                FailureCategory::OriginFetch,
                &origin.url,
                Some(&origin.name),
                &error.to_string(),
            )
            .await?;
        bump(&counters.origins_failed);
        counter!(FETCH_FAILURES, "category" => FailureCategory::OriginFetch.as_str())
            .increment(1);
        tracing::warn!(url = %origin.url, retries, error = %error, "origin fetch failed");
        Ok(())
    }

    async fn ingest_item(
        &self,
        origin: &Origin,
        entry: &ListingEntry,
        force: bool,
    ) -> PipelineResult<ItemOutcome> {
        let url = entry.link.as_str();
        let existing = self.store.id_for_url(url).await?;
        if existing.is_some() && !force {
            tracing::debug!(url, "already stored");
            return Ok(ItemOutcome::Existing);
        }
        if !force && !self.ledger.is_eligible(FailureCategory::ItemFetch, url).await? {
            tracing::debug!(url, "item backing off, skipped");
            return Ok(ItemOutcome::BackingOff);
        }

        self.throttle.acquire(url).await;
        let (body, content_source) = match self.fetch_body(entry).await {
            Ok(found) => found,
            Err(e) => {
                let retries = self
                    .ledger
                    .record(FailureCategory::ItemFetch, url, Some(&entry.title), &e.to_string())
                    .await?;
                counter!(FETCH_FAILURES, "category" => FailureCategory::ItemFetch.as_str())
                    .increment(1);
                tracing::warn!(url, retries, error = %e, "item fetch failed");
                return Ok(ItemOutcome::Failed);
            }
        };

        let outcome = match existing {
            Some(id) => {
                let patch = ItemPatch {
                    title: Patch::Set(entry.title.clone()),
                    body: Patch::Set(body),
                    published: entry.published.map_or(Patch::Keep, Patch::Set),
                    content_source: Patch::Set(content_source.to_string()),
                    ..Default::default()
                };
                self.store.update(id, &patch).await?;
                counter!(ITEMS_UPDATED).increment(1);
                tracing::info!(url, "item refreshed");
                ItemOutcome::Updated
            }
            None => {
                let item = NewItem {
                    url: url.to_string(),
                    title: entry.title.clone(),
                    source_name: origin.name.clone(),
                    origin_url: Some(origin.url.clone()),
                    published: entry.published,
                    downloaded: Utc::now(),
                    content_source: content_source.to_string(),
                    body,
                };
                match self.store.insert(&item).await {
                    Ok(id) => {
                        counter!(ITEMS_STORED).increment(1);
                        tracing::info!(url, id, "item stored");
                        ItemOutcome::Inserted
                    }
                    // Listed twice, or raced with another origin.
                    Err(PipelineError::Conflict { .. }) => ItemOutcome::Existing,
                    Err(e) => return Err(e),
                }
            }
        };

        self.ledger.clear(FailureCategory::ItemFetch, url).await?;
        Ok(outcome)
    }

    /// Readable text for an entry: the page when it extracts, else the feed-embedded content.
    async fn fetch_body(&self, entry: &ListingEntry) -> PipelineResult<(String, &'static str)> {
        let page = match self.fetcher.fetch(&entry.link, None).await? {
            FetchOutcome::Fetched(resource) => self.extractor.extract(&resource.body),
            FetchOutcome::NotModified => Err(PipelineError::Extraction("empty 304 response".into())),
        };

        match page {
            Ok(text) => Ok((text, "page")),
            Err(e) => {
                let fallback = entry
                    .content
                    .as_deref()
                    .map(html_to_text)
                    .filter(|t| !t.is_empty());
                match fallback {
                    Some(text) => {
                        tracing::debug!(url = %entry.link, error = %e, "using feed content");
                        Ok((text, "feed"))
                    }
                    None => Err(e),
                }
            }
        }
    }
}

/// CLI entry point for `fh ingest`.
pub async fn run_ingest(
    config: &Config,
    origins: Vec<Origin>,
    force: bool,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<()> {
    if origins.is_empty() {
        anyhow::bail!("No origins given. Use --opml PATH or --origin NAME=URL.");
    }

    let pool = db::connect(config).await?;
    let coordinator = IngestionCoordinator::new(config, pool.clone(), Arc::new(HtmlExtractor::default()))?
        .with_cancellation(cancel)
        .with_progress(progress.reporter());

    let report = Arc::new(coordinator).run(origins, force).await;

    println!("ingest{}", if report.cancelled { " (cancelled)" } else { "" });
    println!("  origins: {}", report.origins_total);
    println!("    fetched: {}", report.origins_fetched);
    println!("    not modified: {}", report.origins_not_modified);
    println!("    backing off: {}", report.origins_backing_off);
    println!("    failed: {}", report.origins_failed);
    println!("  items inserted: {}", report.items_inserted);
    if force {
        println!("  items refreshed: {}", report.items_updated);
    }
    println!("  items already stored: {}", report.items_existing);
    println!("  items backing off: {}", report.items_backing_off);
    println!("  items failed: {}", report.items_failed);
    println!("ok");

    pool.close().await;
    Ok(())
}
