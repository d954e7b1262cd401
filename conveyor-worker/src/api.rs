//! Worker HTTP API
//!
//! Dispatch and cancel calls from the orchestrator, plus a health endpoint.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use conveyor_core::dto::job::{DispatchAck, JobSpec};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::coordinator::{AcceptError, JobCoordinator};

/// API error type
#[derive(Debug)]
pub enum ApiError {
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<AcceptError> for ApiError {
    fn from(err: AcceptError) -> Self {
        ApiError::Conflict(err.to_string())
    }
}

/// Create the worker router
pub fn create_router(coordinator: Arc<JobCoordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(dispatch_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .with_state(coordinator)
        .layer(TraceLayer::new_for_http())
}

/// POST /jobs
/// Accept one job attempt; 409 when every slot is taken
async fn dispatch_job(
    State(coordinator): State<Arc<JobCoordinator>>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<DispatchAck>), ApiError> {
    let ack = coordinator.accept(spec)?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

/// POST /jobs/{id}/cancel
async fn cancel_job(State(coordinator): State<Arc<JobCoordinator>>, Path(id): Path<Uuid>) -> StatusCode {
    coordinator.cancel(id);
    StatusCode::ACCEPTED
}

/// GET /health
async fn health(State(coordinator): State<Arc<JobCoordinator>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "worker_id": coordinator.worker_id(),
        "capacity": coordinator.capacity(),
        "load": coordinator.load(),
        "running": coordinator.running(),
    }))
}
