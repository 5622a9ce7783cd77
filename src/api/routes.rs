//! API route handlers.
//!
//! All endpoints return JSON. State is the shared `Orchestrator`.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::emitter::AuditEntry;
use crate::engine::breaker::BreakerSnapshot;
use crate::engine::orchestrator::{Orchestrator, StatsSnapshot};
use crate::types::{ValuationError, ValuationRequest, ValuationResult};

pub type AppState = Arc<Orchestrator>;

pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const MAX_AUDIT_LIMIT: usize = 1_000;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioRequest {
    pub properties: Vec<ValuationRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub reason: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl From<&ValuationError> for ErrorBody {
    fn from(err: &ValuationError) -> Self {
        Self {
            error: err.kind().to_string(),
            reason: err.reasons(),
            remediation: err.remediation().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioItem {
    pub index: usize,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ValuationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioResponse {
    pub results: Vec<PortfolioItem>,
    pub valued: usize,
    pub failed: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub orchestrator: StatsSnapshot,
    pub cache_hit_rate: f64,
}

/// Error wrapper turning domain errors into HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub ValuationError);

impl From<ValuationError> for ApiError {
    fn from(err: ValuationError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ValuationError::Validation {
            reasons: vec![rejection.body_text()],
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/valuations
pub async fn post_valuation(
    State(state): State<AppState>,
    body: Result<Json<ValuationRequest>, JsonRejection>,
) -> Result<Json<ValuationResult>, ApiError> {
    let Json(request) = body?;
    let ctx = state.new_context();
    let result = state.value_property(request, &ctx).await?;
    Ok(Json(result))
}

/// POST /api/portfolio
pub async fn post_portfolio(
    State(state): State<AppState>,
    body: Result<Json<PortfolioRequest>, JsonRejection>,
) -> Result<Json<PortfolioResponse>, ApiError> {
    let Json(request) = body?;
    let ctx = state.new_context();
    let outcome = state.value_portfolio(request.properties, &ctx).await?;

    let results: Vec<PortfolioItem> = outcome
        .results
        .into_iter()
        .enumerate()
        .map(|(index, r)| match r {
            Ok(result) => PortfolioItem {
                index,
                status: 200,
                result: Some(result),
                error: None,
            },
            Err(err) => PortfolioItem {
                index,
                status: err.status_code(),
                result: None,
                error: Some(ErrorBody::from(&err)),
            },
        })
        .collect();
    let valued = results.iter().filter(|i| i.result.is_some()).count();

    Ok(Json(PortfolioResponse {
        failed: results.len() - valued,
        valued,
        results,
        delivered: outcome.delivered,
        delivery_failures: outcome.delivery_failures,
    }))
}

/// GET /api/audit?limit=N
pub async fn get_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).min(MAX_AUDIT_LIMIT);
    Json(state.emitter().audit().recent(limit).await)
}

/// GET /api/breakers
pub async fn get_breakers(State(state): State<AppState>) -> Json<Vec<BreakerSnapshot>> {
    let mut snapshots = state.fetcher().breaker_snapshots().await;
    snapshots.push(state.emitter().breaker_snapshot().await);
    Json(snapshots)
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        orchestrator: state.stats(),
        cache_hit_rate: state.fetcher().stats().cache_hit_rate(),
    })
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
