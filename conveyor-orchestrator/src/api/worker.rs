//! Worker API Handlers
//!
//! Heartbeats and worker listing.

use axum::{Json, extract::State, http::StatusCode};
use conveyor_core::domain::worker::Worker;
use conveyor_core::dto::worker::Heartbeat;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// POST /workers/heartbeat
/// Register or refresh a worker
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(hb): Json<Heartbeat>,
) -> ApiResult<StatusCode> {
    if hb.worker_id.is_empty() {
        return Err(ApiError::BadRequest("worker_id cannot be empty".to_string()));
    }
    if hb.address.is_empty() {
        return Err(ApiError::BadRequest("address cannot be empty".to_string()));
    }

    state.scheduler.heartbeat(&hb);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /workers
/// List all known workers
pub async fn list_workers(State(state): State<AppState>) -> Json<Vec<Worker>> {
    tracing::debug!("Listing all workers");
    Json(state.scheduler.workers())
}
