//! Minimal operator control API.
//!
//! Privileged-operator surface (no end-user authentication): pause/resume
//! a collector, force a circuit breaker, drain the scrape queue, read
//! health snapshots, and reprocess dead-letter items. Serve it with
//! `axum::serve` on an internal listener.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::health::{HealthSnapshot, SourceHealthRegistry, SourceStatus};
use crate::queue::{DeadLetterRow, PersistedQueue};
use crate::record::{CollectorKind, Priority};
use crate::router::RouterHandle;

/// Shared state behind the admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    /// Health registry for snapshots, pause/resume and breaker overrides
    pub health: Arc<SourceHealthRegistry>,
    /// Persisted queues for drain and dead-letter access
    pub queue: PersistedQueue,
    /// Router handle for dead-letter reprocessing
    pub router: RouterHandle,
}

/// Bind `addr` and serve the admin router until the task is cancelled.
pub async fn serve(state: AdminState, addr: &str) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::Error::permanent("admin.bind", e.to_string()))?;
    info!(addr, "admin endpoint listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| crate::Error::permanent("admin.serve", e.to_string()))
}

/// Build the admin router.
#[must_use]
pub fn router(state: AdminState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_snapshot))
        .route("/collectors/:id/pause", post(pause_collector))
        .route("/collectors/:id/resume", post(resume_collector))
        .route("/collectors/:id/breaker/:action", post(force_breaker))
        .route("/queues/scrape/drain", post(drain_scrape_queue))
        .route("/dead-letter", get(list_dead_letter))
        .route("/dead-letter/:id/reprocess", post(reprocess_dead_letter))
        .with_state(state)
}

async fn health_snapshot(State(state): State<AdminState>) -> Json<Vec<HealthSnapshot>> {
    Json(state.health.snapshot_all())
}

fn parse_collector(id: &str) -> Result<CollectorKind, (StatusCode, String)> {
    id.parse::<CollectorKind>()
        .map_err(|e| (StatusCode::NOT_FOUND, e))
}

async fn pause_collector(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let kind = parse_collector(&id)?;
    state
        .health
        .set_status(kind, SourceStatus::Maintenance, "operator pause");
    info!(collector = %kind, "collector paused by operator");
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_collector(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let kind = parse_collector(&id)?;
    state
        .health
        .set_status(kind, SourceStatus::Active, "operator resume");
    info!(collector = %kind, "collector resumed by operator");
    Ok(StatusCode::NO_CONTENT)
}

async fn force_breaker(
    State(state): State<AdminState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let kind = parse_collector(&id)?;
    let forced = match action.as_str() {
        "open" => Some(true),
        "close" => Some(false),
        "reset" => None,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown breaker action '{other}' (open|close|reset)"),
            ))
        }
    };
    state.health.force_breaker(kind, forced);
    Ok(StatusCode::NO_CONTENT)
}

async fn drain_scrape_queue(
    State(state): State<AdminState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let released = state
        .queue
        .scrape_drain()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    // Candidates parked on the drained requests are forwarded unenriched
    // once their enrichment timeout fires.
    Ok(Json(serde_json::json!({ "released": released.len() })))
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_dead_letter(
    State(state): State<AdminState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DeadLetterRow>>, (StatusCode, String)> {
    let rows = state
        .queue
        .dead_letter_list(params.limit)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(rows))
}

async fn reprocess_dead_letter(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let entry = state
        .queue
        .dead_letter_take(id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, format!("no dead-letter row {id}")))?;

    let mut candidate = entry.candidate;
    // A fresh attempt budget; the operator explicitly asked for a replay.
    candidate.attempts = 0;
    candidate.priority = Priority::Low;
    state
        .router
        .submit(candidate)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    info!(dead_letter_id = id, "dead-letter item reinjected");
    Ok(StatusCode::ACCEPTED)
}
