//! HTTP surface: upload endpoint, stage catalog, status and history.

pub mod error;
pub mod payload;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::aggregate::DiagnosticResult;
use crate::consts::DEFAULT_HISTORY_LIMIT;
use crate::engine::Engine;
use crate::error::DiagnosisError;
use crate::history::{DiagnosisLog, HistoryEntry};
use crate::present::{DiagnosisPayload, present};
use crate::stage::StageDescription;
use error::ApiError;

#[derive(Debug, Default)]
struct Counters {
    served: AtomicU64,
    failed: AtomicU64,
}

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<dyn Engine>,
    catalog: Arc<Vec<StageDescription>>,
    history: Option<Arc<dyn DiagnosisLog>>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    started: Instant,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn Engine>,
        catalog: Vec<StageDescription>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            catalog: Arc::new(catalog),
            history: None,
            shutdown,
            counters: Arc::new(Counters::default()),
            started: Instant::now(),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn DiagnosisLog>) -> Self {
        self.history = Some(history);
        self
    }

    /// `(served, failed)` diagnoses since startup.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.counters.served.load(Ordering::Relaxed),
            self.counters.failed.load(Ordering::Relaxed),
        )
    }

    fn history(&self) -> Result<&Arc<dyn DiagnosisLog>, ApiError> {
        self.history
            .as_ref()
            .ok_or_else(|| ApiError::NotFound("history is disabled".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub name: String,
    pub version: String,
    pub stages: Vec<String>,
    pub served: u64,
    pub failed: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Build the router. Bodies larger than twice `max_upload_bytes` are cut
/// off before parsing; the ingestor enforces the exact limit.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/diagnose", post(diagnose))
        .route("/api/stages", get(stages))
        .route("/api/status", get(status))
        .route("/api/history", get(history).delete(clear_history))
        .route("/api/history/export", get(export_history))
        .layer(DefaultBodyLimit::max(max_upload_bytes.saturating_mul(2)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;
    tracing::info!("server stopped");
    Ok(())
}

async fn diagnose(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<DiagnosisPayload>, ApiError> {
    match run_diagnosis(&state, request).await {
        Ok(result) => {
            state.counters.served.fetch_add(1, Ordering::Relaxed);
            Ok(Json(present(&result)))
        }
        Err(err) => {
            state.counters.failed.fetch_add(1, Ordering::Relaxed);
            Err(err.into())
        }
    }
}

async fn run_diagnosis(
    state: &AppState,
    request: Request,
) -> Result<DiagnosticResult, DiagnosisError> {
    let parsed = payload::parse(request).await?;
    // Cancelled on shutdown, or when this handler is dropped because the
    // client went away.
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();
    state.engine.diagnose(parsed, cancel).await
}

async fn stages(State(state): State<AppState>) -> Json<Vec<StageDescription>> {
    Json(state.catalog.as_ref().clone())
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let (served, failed) = state.counts();
    Json(StatusReport {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        stages: state.catalog.iter().map(|s| s.id.clone()).collect(),
        served,
        failed,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.history()?.recent(limit).await?))
}

async fn clear_history(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.history()?.clear().await?;
    tracing::info!("history cleared");
    Ok(StatusCode::NO_CONTENT)
}

async fn export_history(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let entries = state.history()?.all().await?;
    let body = serde_json::to_string_pretty(&entries).context("failed to serialize history")?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"dxgate-history.json\"",
            ),
        ],
        body,
    ))
}
