//! HTTP API over the cache service.
//!
//! - GET  /health
//! - GET  /v1/cache/stats
//! - GET  /v1/cache/history?window_secs=
//! - GET  /metrics
//! - POST /v1/cache/admit
//! - POST /v1/cache/prefetch

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::node::{NodeHints, TokenId};
use crate::cache::radix_tree::CacheError;
use crate::metrics::exporter::CacheMetrics;
use crate::metrics::timeseries::CacheSnapshot;
use crate::scheduler::service::{AdmitOutcome, CacheHandle, CacheStats, PrefetchSummary, ServiceError};

/// Application state shared across handlers.
pub struct AppState {
    pub cache: CacheHandle,
    pub metrics: Arc<CacheMetrics>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/history", get(cache_history))
        .route("/v1/cache/admit", post(admit))
        .route("/v1/cache/prefetch", post(prefetch))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AdmitRequest {
    pub tokens: Vec<TokenId>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub workflow_eviction_value: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AdmitResponse {
    pub id: String,
    #[serde(flatten)]
    pub outcome: AdmitOutcome,
}

#[derive(Debug, Deserialize)]
pub struct PrefetchRequest {
    pub tokens: Vec<TokenId>,
}

#[derive(Debug, Serialize)]
pub struct PrefetchResponse {
    pub id: String,
    #[serde(flatten)]
    pub summary: PrefetchSummary,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub window_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub snapshots: Vec<CacheSnapshot>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub total_tokens: usize,
    pub utilization: f64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// An error rendered as a JSON body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let status = match &e {
            ServiceError::Cache(CacheError::CapacityExhausted { .. }) => StatusCode::INSUFFICIENT_STORAGE,
            ServiceError::Cache(CacheError::LengthMismatch { .. }) => StatusCode::BAD_REQUEST,
            ServiceError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::HistoryDisabled => StatusCode::NOT_FOUND,
            ServiceError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn admit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdmitRequest>,
) -> Result<Json<AdmitResponse>, ApiError> {
    if req.tokens.is_empty() {
        return Err(ApiError::bad_request("tokens must not be empty"));
    }
    let request_id = Uuid::new_v4().to_string();

    info!(request_id = request_id, tokens = req.tokens.len(), "Admit request");

    let hints = NodeHints {
        priority: req.priority,
        workflow_eviction_value: req.workflow_eviction_value,
    };
    let outcome = state.cache.admit(req.tokens, hints).await.map_err(|e| {
        warn!(request_id = request_id, error = %e, "Admit failed");
        ApiError::from(e)
    })?;

    Ok(Json(AdmitResponse {
        id: format!("admit-{request_id}"),
        outcome,
    }))
}

async fn prefetch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PrefetchRequest>,
) -> Result<Json<PrefetchResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let summary = state.cache.prefetch(req.tokens).await?;

    info!(
        request_id = request_id,
        started = summary.started,
        host_hit = summary.host_hit_tokens,
        "Prefetch request"
    );

    Ok(Json(PrefetchResponse {
        id: format!("prefetch-{request_id}"),
        summary,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = state.cache.stats().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        total_tokens: stats.snapshot.total_tokens,
        utilization: stats.snapshot.utilization,
    }))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<CacheStats>, ApiError> {
    Ok(Json(state.cache.stats().await?))
}

async fn cache_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let snapshots = state.cache.history(params.window_secs).await?;
    Ok(Json(HistoryResponse { snapshots }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state.metrics.render().map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: e.to_string(),
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
