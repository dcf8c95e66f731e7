//! HTTP surface: health check and the JSON routes behind the dashboard.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::error;

use crate::error::StoreError;
use crate::model::Market;
use crate::quota::{QuotaReport, QuotaTracker};
use crate::store::{CsvDirBackend, SnapshotStore};
use crate::views::{DashboardStats, GameSummary, LatestState, Movement, ViewBuilder, ViewResult};

/// Service health state
#[derive(Clone, Default)]
pub struct HealthState {
    pub last_cycle_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    pub last_cycle_rows: Arc<RwLock<usize>>,
    pub error_count: Arc<RwLock<usize>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, rows: usize) {
        *self.last_cycle_time.write().await = Some(Utc::now());
        *self.last_cycle_rows.write().await = rows;
        *self.error_count.write().await = 0;
    }

    pub async fn record_error(&self) {
        *self.error_count.write().await += 1;
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SnapshotStore<CsvDirBackend>>,
    pub quota: Arc<QuotaTracker>,
    pub health: HealthState,
}

impl AppState {
    pub fn new(store: SnapshotStore<CsvDirBackend>, quota: QuotaTracker, health: HealthState) -> Self {
        Self {
            store: Arc::new(store),
            quota: Arc::new(quota),
            health,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Snapshot store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            ApiError::Store(e) => {
                error!("Store error serving request: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "STORE_ERROR")
            }
            ApiError::Internal(msg) => {
                error!("Internal error serving request: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/usage", get(usage_handler))
        .route("/api/games", get(games_handler))
        .route("/api/games/:game_id", get(game_handler))
        .route("/api/games/:game_id/movement/:market", get(movement_handler))
        .route("/download/latest", get(download_latest_handler))
        .with_state(state)
}

/// Runs blocking file reads off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let health = &state.health;
    let last_cycle = health.last_cycle_time.read().await;
    let last_rows = health.last_cycle_rows.read().await;
    let errors = health.error_count.read().await;

    let status = if *errors > 5 { "degraded" } else { "ok" };

    let http_status = if *errors > 10 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "service": "line-movement",
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
            "last_cycle": last_cycle.map(|t| t.to_rfc3339()),
            "last_cycle_rows": *last_rows,
            "consecutive_errors": *errors
        })),
    )
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<ViewResult<DashboardStats>>, ApiError> {
    blocking(move || {
        let report = state.quota.read_stats(Utc::now());
        Ok(ViewBuilder::new(&*state.store).dashboard_stats(&report)?)
    })
    .await
    .map(Json)
}

async fn usage_handler(State(state): State<AppState>) -> Result<Json<QuotaReport>, ApiError> {
    blocking(move || Ok(state.quota.read_stats(Utc::now()))).await.map(Json)
}

async fn games_handler(State(state): State<AppState>) -> Result<Json<ViewResult<Vec<GameSummary>>>, ApiError> {
    blocking(move || Ok(ViewBuilder::new(&*state.store).games()?))
        .await
        .map(Json)
}

#[derive(Debug, Serialize)]
struct GameView {
    #[serde(flatten)]
    state: LatestState,
    skipped_files: Vec<String>,
}

async fn game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameView>, ApiError> {
    blocking(move || {
        let result = ViewBuilder::new(&*state.store).latest_state(&game_id)?;
        match result.view {
            Some(latest) => Ok(GameView {
                state: latest,
                skipped_files: result.skipped_files,
            }),
            None => Err(ApiError::NotFound(format!("no odds recorded for game {}", game_id))),
        }
    })
    .await
    .map(Json)
}

async fn movement_handler(
    State(state): State<AppState>,
    Path((game_id, market)): Path<(String, String)>,
) -> Result<Json<ViewResult<Movement>>, ApiError> {
    let market: Market = market.parse().map_err(ApiError::BadRequest)?;
    blocking(move || Ok(ViewBuilder::new(&*state.store).movement(&game_id, market)?))
        .await
        .map(Json)
}

async fn download_latest_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = state.store.clone();
    let key = blocking(move || Ok(store.latest_daily_key()?))
        .await?
        .ok_or_else(|| ApiError::NotFound("no snapshot files yet".to_string()))?;

    let path = state.store.daily().backend().path_for(&key);
    let body = tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound(key.clone())
        } else {
            ApiError::Internal(format!("failed to read {}: {}", path.display(), e))
        }
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", key),
            ),
        ],
        body,
    )
        .into_response())
}
