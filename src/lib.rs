//! # Feed Harness
//!
//! A resilient feed ingestion and enrichment pipeline with a searchable
//! local store.
//!
//! Feed Harness walks a list of subscribed origins (RSS/Atom), fetches new
//! items politely (per-host token buckets, conditional requests, backoff on
//! failure), extracts readable text, and stores it in SQLite with a
//! synchronously maintained FTS5 index. A second pass enriches items through
//! a remote completion model with per-model circuit breakers, multi-model
//! fallback and a content-addressed response cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Origins  │──▶│  Ingestion  │──▶│ SQLite store │◀──│ Enrich-  │
//! │ OPML/CLI │   │ throttle +  │   │ items + FTS5 │   │ ment     │
//! └──────────┘   │ fetch +     │   │ ledger/cache │   │ breakers │
//!                │ extract     │   └──────┬───────┘   └──────────┘
//!                └─────────────┘          │
//!                             ┌───────────┴──────┐
//!                             ▼                  ▼
//!                        ┌─────────┐        ┌─────────┐
//!                        │   CLI   │        │  HTTP   │
//!                        │  (fh)   │        │  read   │
//!                        └─────────┘        └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fh init                            # create database
//! fh ingest --opml feeds.opml        # fetch new items
//! FH_API_KEY=... fh enrich           # summarize and score
//! fh search "rust async" --sort score
//! fh serve                           # start the read API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`throttle`] | Per-origin token buckets |
//! | [`validators`] | Conditional fetch cache (ETag / Last-Modified) |
//! | [`ledger`] | Failure ledger with exponential backoff |
//! | [`store`] | Durable item store and full-text index |
//! | [`search`] | Query language and search requests |
//! | [`circuit_breaker`] | Three-state failure gate |
//! | [`enrich`] | Enrichment client with model fallback |
//! | [`cache`] | Enrichment response cache |
//! | [`fetch`] | Conditional HTTP fetch with SSRF guard |
//! | [`feed`] | RSS / Atom listing parser |
//! | [`opml`] | Subscription lists and failure reports |
//! | [`extract`] | Readable-text extraction |
//! | [`ingest`] | Ingestion coordinator |
//! | [`enrich_cmd`] | Enrichment coordinator |
//! | [`server`] | Read-only HTTP API |
//! | [`health`] | Health check contract |
//! | [`get`] | Item lookup and deletion by URL |
//! | [`stats`] | Store statistics |
//! | [`progress`] | Stderr progress reporting |
//! | [`logging`] | Tracing subscriber setup |
//! | [`metrics`] | Prometheus recorder and series names |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod enrich;
pub mod enrich_cmd;
pub mod error;
pub mod extract;
pub mod feed;
pub mod fetch;
pub mod get;
pub mod health;
pub mod ingest;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod opml;
pub mod progress;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod throttle;
pub mod validators;
