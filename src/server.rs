//! Read-only HTTP API for reader front-ends.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health report (503 when unhealthy) |
//! | `GET`  | `/stats` | Aggregate store counts |
//! | `GET`  | `/search` | Ranked, filtered, paged search |
//! | `GET`  | `/items?url=` | One item by URL |
//! | `GET`  | `/failures` | Failure ledger as JSON (`?category=` to narrow) |
//! | `GET`  | `/failures.opml` | Failing origins as an OPML document |
//! | `GET`  | `/metrics` | Prometheus exposition of pipeline counters |
//!
//! `/search` accepts `q`, `category`, `source`, `since`, `until`, `sort`
//! (`recency`, `score`, `source`, `relevance`), `page` and `page_size`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown sort mode: 'x'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! readers.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::error::PipelineError;
use crate::get::{get_item, ItemResponse};
use crate::health::{check_health, HealthReport, HealthStatus};
use crate::ledger::FailureLedger;
use crate::metrics;
use crate::models::{Category, FailureCategory, FailureRecord, SearchPage};
use crate::opml::failure_report;
use crate::search::{parse_date_bound, SearchFilters, SearchRequest, SortMode, DEFAULT_PAGE_SIZE};
use crate::store::{ItemStore, StoreStats};

/// Shared state handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    store: ItemStore,
    ledger: FailureLedger,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(store: ItemStore, ledger: FailureLedger, metrics: PrometheusHandle) -> Self {
        Self {
            store,
            ledger,
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/search", get(handle_search))
        .route("/items", get(handle_item))
        .route("/failures", get(handle_failures))
        .route("/failures.opml", get(handle_failures_opml))
        .route("/metrics", get(handle_metrics))
        .layer(cors)
        .with_state(state)
}

/// Serve the read API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let state = AppState::new(
        ItemStore::new(pool.clone()),
        FailureLedger::new(pool, &config.ledger),
        metrics::install()?,
    );

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("feed-harness API listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(message) => bad_request(message),
            other => {
                tracing::error!(error = %other, "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: other.to_string(),
                }
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<PipelineError>() {
            Ok(pipeline) => pipeline.into(),
            Err(other) => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: other.to_string(),
            },
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

// ============ Handlers ============

async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = check_health(state.store.pool()).await;
    let status = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    Ok(Json(state.store.stats().await?))
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
    category: Option<String>,
    source: Option<String>,
    since: Option<String>,
    until: Option<String>,
    sort: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

impl SearchParams {
    fn into_request(self) -> Result<SearchRequest, AppError> {
        let category = match self.category.as_deref().filter(|c| !c.is_empty()) {
            Some(c) => Some(c.parse::<Category>().map_err(bad_request)?),
            None => None,
        };
        let sort = match self.sort.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => s.parse::<SortMode>().map_err(bad_request)?,
            None => SortMode::default(),
        };
        let since = match self.since.as_deref() {
            Some(s) => Some(parse_date_bound(s, false).map_err(|e| bad_request(e.to_string()))?),
            None => None,
        };
        let until = match self.until.as_deref() {
            Some(s) => Some(parse_date_bound(s, true).map_err(|e| bad_request(e.to_string()))?),
            None => None,
        };

        Ok(SearchRequest {
            query: self.q.unwrap_or_default(),
            filters: SearchFilters {
                category,
                source_name: self.source.filter(|s| !s.is_empty()),
                since,
                until,
            },
            sort,
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        }
        .normalized())
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchPage>, AppError> {
    let request = params.into_request()?;
    Ok(Json(state.store.search(&request).await?))
}

#[derive(Debug, Deserialize)]
struct ItemParams {
    url: Option<String>,
}

async fn handle_item(
    State(state): State<AppState>,
    Query(params): Query<ItemParams>,
) -> Result<Json<ItemResponse>, AppError> {
    let url = params
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| bad_request("url must not be empty"))?;
    match get_item(&state.store, &url).await? {
        Some(item) => Ok(Json(item)),
        None => Err(not_found(format!("item not found: {}", url))),
    }
}

#[derive(Debug, Deserialize)]
struct FailureParams {
    category: Option<String>,
}

async fn handle_failures(
    State(state): State<AppState>,
    Query(params): Query<FailureParams>,
) -> Result<Json<Vec<FailureRecord>>, AppError> {
    let category = match params.category.as_deref() {
        Some(c) => Some(c.parse::<FailureCategory>().map_err(bad_request)?),
        None => None,
    };
    Ok(Json(state.ledger.list(category).await?))
}

async fn handle_failures_opml(State(state): State<AppState>) -> Result<Response, AppError> {
    let records = state.ledger.list(Some(FailureCategory::OriginFetch)).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/x-opml; charset=utf-8")],
        failure_report(&records),
    )
        .into_response())
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
