//! Enrichment coordinator: backfills summary, category, scores and keywords.
//!
//! Items without a summary (or every item under `--force`) are processed in
//! batches of `enrichment.batch_size`. Each successful item is written with
//! its own store transaction, so an interrupted run keeps everything it
//! finished. An exhausted model list is recorded in the failure ledger under
//! `enrichment` and the run moves on to the next item.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::EnrichmentCache;
use crate::config::Config;
use crate::db;
use crate::enrich::EnrichmentClient;
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::FailureLedger;
use crate::models::{FailureCategory, ItemPatch};
use crate::progress::{NoProgress, ProgressEvent, ProgressMode, ProgressReporter};
use crate::store::ItemStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub pending: u64,
    pub enriched: u64,
    pub failed: u64,
    pub backing_off: u64,
    /// Deleted between selection and processing.
    pub missing: u64,
    pub cancelled: bool,
}

pub struct EnrichmentCoordinator {
    store: ItemStore,
    ledger: FailureLedger,
    client: EnrichmentClient,
    batch_size: usize,
    progress_every: usize,
    grace: Duration,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
}

impl EnrichmentCoordinator {
    pub fn new(config: &Config, pool: SqlitePool, client: EnrichmentClient) -> Self {
        Self {
            store: ItemStore::new(pool.clone()),
            ledger: FailureLedger::new(pool, &config.ledger),
            client,
            batch_size: config.enrichment.batch_size.max(1),
            progress_every: config.enrichment.progress_every.max(1),
            grace: Duration::from_secs(config.download.shutdown_grace_secs),
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Enrich pending items. Only store errors abort the run.
    pub async fn run(&self, force: bool, limit: Option<usize>) -> PipelineResult<EnrichReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("enrich", run_id = %run_id);
        self.run_inner(force, limit).instrument(span).await
    }

    async fn run_inner(&self, force: bool, limit: Option<usize>) -> PipelineResult<EnrichReport> {
        let ids = self.store.pending_enrichment(force, limit).await?;
        let total = ids.len() as u64;
        let mut report = EnrichReport {
            pending: total,
            ..Default::default()
        };
        tracing::info!(pending = total, force, models = ?self.client.models(), "enrichment started");

        let mut done = 0u64;
        'batches: for (batch_no, batch) in ids.chunks(self.batch_size).enumerate() {
            for &id in batch {
                if self.cancel.is_cancelled() {
                    break 'batches;
                }

                let Some(item) = self.store.get_by_id(id).await? else {
                    report.missing += 1;
                    continue;
                };

                if !force && !self.ledger.is_eligible(FailureCategory::Enrichment, &item.url).await? {
                    tracing::debug!(url = %item.url, "enrichment backing off, skipped");
                    report.backing_off += 1;
                } else {
                    let result = tokio::select! {
                        result = self.client.enrich(&item) => result,
                        _ = async {
                            self.cancel.cancelled().await;
                            tokio::time::sleep(self.grace).await;
                        } => {
                            tracing::warn!(url = %item.url, "grace period elapsed, abandoning enrichment");
                            break 'batches;
                        }
                    };

                    match result {
                        Ok(enrichment) => {
                            self.store.update(id, &ItemPatch::from_enrichment(&enrichment)).await?;
                            self.ledger.clear(FailureCategory::Enrichment, &item.url).await?;
                            tracing::info!(url = %item.url, category = %enrichment.category, "item enriched");
                            report.enriched += 1;
                        }
                        Err(PipelineError::StoreIo(e)) => return Err(PipelineError::StoreIo(e)),
                        Err(e) => {
                            let retries = self
                                .ledger
                                .record(
                                    FailureCategory::Enrichment,
                                    &item.url,
                                    Some(&item.title),
                                    &e.to_string(),
                                )
                                .await?;
                            tracing::warn!(url = %item.url, retries, error = %e, "enrichment failed");
                            report.failed += 1;
                        }
                    }
                }

                done += 1;
                if done % self.progress_every as u64 == 0 || done == total {
                    tracing::info!(done, total, enriched = report.enriched, failed = report.failed, "enrichment progress");
                    self.progress.report(ProgressEvent::Enriching { done, total });
                }
            }
            tracing::debug!(batch = batch_no + 1, size = batch.len(), "batch finished");
        }

        report.cancelled = self.cancel.is_cancelled();
        for (model, state, counts) in self.client.breaker_states() {
            tracing::debug!(
                model = %model,
                state = %state,
                trips = counts.trips,
                rejected = counts.rejected,
                recoveries = counts.recoveries,
                "breaker state at end of run"
            );
        }
        tracing::info!(
            enriched = report.enriched,
            failed = report.failed,
            backing_off = report.backing_off,
            cancelled = report.cancelled,
            "enrichment finished"
        );
        Ok(report)
    }
}

/// CLI entry point for `fh enrich`.
pub async fn run_enrich(
    config: &Config,
    force: bool,
    limit: Option<usize>,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<()> {
    if !config.enrichment.is_configured() {
        bail!("Enrichment is not configured. Set [enrichment] host and models in config.");
    }

    let pool = db::connect(config).await?;
    let cache = EnrichmentCache::new(pool.clone(), config.enrichment.cache_max_age_days);
    let client = EnrichmentClient::from_config(&config.enrichment, cache)?;
    let coordinator = EnrichmentCoordinator::new(config, pool.clone(), client)
        .with_cancellation(cancel)
        .with_progress(progress.reporter());

    let report = coordinator.run(force, limit).await?;

    println!("enrich{}", if report.cancelled { " (cancelled)" } else { "" });
    println!("  pending: {}", report.pending);
    println!("  enriched: {}", report.enriched);
    println!("  failed: {}", report.failed);
    println!("  backing off: {}", report.backing_off);
    if report.missing > 0 {
        println!("  deleted meanwhile: {}", report.missing);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}
