use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::models::{
    ActionEvent, ActorRollup, AuditRecord, EventSummary, GlobalRollup, LeaderboardEntry, Period,
    Scope, TrackerError, VerifyOutcome,
};
use crate::tracker::{EventStore, MassUnit, ReadAdapter, Reconciler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub events: EventStore,
    pub reconciler: Reconciler,
    pub reads: Arc<ReadAdapter>,
    pub max_leaderboard_limit: usize,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/actions", post(submit_action))
        .route("/api/actions/:id", get(get_action))
        .route("/api/actions/:id/verify", post(verify_action))
        .route("/api/actions/recent", get(get_recent_actions))
        .route("/api/actors/:id/profile", put(put_actor_profile))
        .route("/api/rollups/actor/:id", get(get_actor_rollup))
        .route("/api/rollups/global", get(get_global_rollup))
        .route("/api/leaderboard", get(get_leaderboard))
        .route("/api/audits", get(get_audits))
        .route("/api/admin/reconcile", post(post_reconcile))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Submit a new action (starts unverified)
async fn submit_action(
    State(state): State<AppState>,
    Json(req): Json<SubmitActionRequest>,
) -> Result<(StatusCode, Json<SubmitActionResponse>), ApiError> {
    let unit = MassUnit::parse(&req.unit)?;
    let event_id = state.events.append(&req.actor_id, req.quantity, unit)?;
    Ok((StatusCode::CREATED, Json(SubmitActionResponse { event_id })))
}

/// Verification callback (at-least-once; repeats are no-ops)
async fn verify_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VerifyActionResponse>, ApiError> {
    let outcome = state.events.mark_verified(&id)?;
    Ok(Json(VerifyActionResponse { outcome }))
}

/// Look up one action by id
async fn get_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionEvent>, ApiError> {
    state
        .events
        .get_event(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::Tracker(TrackerError::NotFound(format!("event {}", id))))
}

/// Recent actions, newest first, optionally for one actor
async fn get_recent_actions(
    State(state): State<AppState>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<RecentActionsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500) as usize;
    let events = state
        .reads
        .recent_events(params.actor_id.as_deref(), limit)?;
    Ok(Json(RecentActionsResponse {
        count: events.len(),
        events,
    }))
}

/// Display-name upsert, fed by the identity service
async fn put_actor_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ProfileRequest>,
) -> Result<StatusCode, ApiError> {
    state.events.upsert_profile(&id, &req.display_name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Per-actor rollup; `rollup: null` is the legitimate empty state for an
/// actor with no verified events in any generation
async fn get_actor_rollup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActorRollupResponse>, ApiError> {
    let rollup = state.reads.actor_rollup(&id)?;
    Ok(Json(ActorRollupResponse {
        actor_id: id,
        rollup,
    }))
}

/// System-wide rollup
async fn get_global_rollup(
    State(state): State<AppState>,
) -> Result<Json<GlobalRollup>, ApiError> {
    Ok(Json(state.reads.global_rollup()?))
}

/// Ranked leaderboard
async fn get_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let period = match params.period.as_deref() {
        None => Period::AllTime,
        Some(raw) => Period::from_str(raw).ok_or_else(|| {
            ApiError::BadRequest(format!("unknown period: {}", raw))
        })?,
    };
    let scope = match params.actors.as_deref() {
        None | Some("") => Scope::Global,
        Some(csv) => Scope::Actors(
            csv.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
    };
    let limit = params
        .limit
        .unwrap_or(10)
        .min(state.max_leaderboard_limit as u32) as usize;

    let entries = state.reads.leaderboard(period, &scope, limit)?;
    Ok(Json(LeaderboardResponse {
        period,
        count: entries.len(),
        entries,
    }))
}

/// Reconciliation audit history, newest first
async fn get_audits(
    State(state): State<AppState>,
    Query(params): Query<AuditQuery>,
) -> Result<Json<AuditsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500) as usize;
    let audits = state.reconciler.list_audits(limit)?;
    Ok(Json(AuditsResponse {
        count: audits.len(),
        audits,
    }))
}

/// On-demand reconciliation pass (operational repair)
async fn post_reconcile(
    State(state): State<AppState>,
) -> Result<Json<AuditRecord>, ApiError> {
    Ok(Json(state.reconciler.reconcile()?))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct SubmitActionRequest {
    actor_id: String,
    quantity: f64,
    unit: String,
}

#[derive(Serialize)]
struct SubmitActionResponse {
    event_id: String,
}

#[derive(Serialize)]
struct VerifyActionResponse {
    outcome: VerifyOutcome,
}

#[derive(Deserialize)]
struct RecentQuery {
    actor_id: Option<String>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct ProfileRequest {
    display_name: String,
}

#[derive(Serialize)]
struct ActorRollupResponse {
    actor_id: String,
    rollup: Option<ActorRollup>,
}

#[derive(Deserialize)]
struct LeaderboardQuery {
    period: Option<String>,
    /// Comma-separated actor-id subset (friends/team scope)
    actors: Option<String>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct LeaderboardResponse {
    period: Period,
    count: usize,
    entries: Vec<LeaderboardEntry>,
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct AuditsResponse {
    count: usize,
    audits: Vec<AuditRecord>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct RecentActionsResponse {
    count: usize,
    events: Vec<EventSummary>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Tracker(TrackerError),
    BadRequest(String),
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        ApiError::Tracker(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Tracker(TrackerError::InvalidInput(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Tracker(TrackerError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg),
            ApiError::Tracker(TrackerError::Conflict(msg)) => {
                // Transient: every attempt was rolled back whole, safe to retry
                tracing::warn!("Write conflict surfaced to caller: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Transient write conflict, retry the request".to_string(),
                )
            }
            ApiError::Tracker(TrackerError::Storage(err)) => {
                tracing::error!("Storage error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err = TrackerError::NotFound("event x".to_string());
        let api_err: ApiError = err.into();

        match api_err {
            ApiError::Tracker(TrackerError::NotFound(_)) => (),
            _ => panic!("Expected NotFound"),
        }
    }
}
