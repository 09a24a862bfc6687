//! Prometheus metrics: one process-wide recorder and the series it exports.
//!
//! Instrumented code calls the `metrics` macros directly with the names
//! below. Without an installed recorder those calls are no-ops, so CLI
//! runs pay nothing; `fh serve` installs the recorder and exposes it at
//! `GET /metrics`.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::error::{PipelineError, PipelineResult};

pub const ENRICH_REQUESTS: &str = "fh_enrich_requests_total";
pub const ENRICH_FAILURES: &str = "fh_enrich_failures_total";
pub const ENRICH_LATENCY_MS: &str = "fh_enrich_latency_ms";
pub const CACHE_HITS: &str = "fh_enrich_cache_hits_total";
pub const CACHE_MISSES: &str = "fh_enrich_cache_misses_total";
pub const ITEMS_STORED: &str = "fh_ingest_items_stored_total";
pub const ITEMS_UPDATED: &str = "fh_ingest_items_updated_total";
pub const FETCH_FAILURES: &str = "fh_ingest_fetch_failures_total";

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the recorder on first call; later calls return the same handle.
pub fn install() -> PipelineResult<PrometheusHandle> {
    HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| PipelineError::Config(format!("metrics recorder: {}", e)))?;
            describe();
            Ok(handle)
        })
        .cloned()
}

fn describe() {
    describe_counter!(ENRICH_REQUESTS, "Completion requests sent, per model.");
    describe_counter!(ENRICH_FAILURES, "Completion attempts that failed, per model.");
    describe_histogram!(ENRICH_LATENCY_MS, "Completion round-trip time in milliseconds, per model.");
    describe_counter!(CACHE_HITS, "Enrichment cache lookups served from the cache.");
    describe_counter!(CACHE_MISSES, "Enrichment cache lookups that found nothing usable.");
    describe_counter!(ITEMS_STORED, "New items written by ingestion.");
    describe_counter!(ITEMS_UPDATED, "Stored items refreshed by forced ingestion.");
    describe_counter!(FETCH_FAILURES, "Origin and item fetches recorded in the failure ledger.");
}
