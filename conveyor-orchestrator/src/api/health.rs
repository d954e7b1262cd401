//! Health Check API Handler

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::api::AppState;

/// GET /health
/// Liveness plus a rough view of the load on the control plane
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let workers = state.scheduler.workers();
    let healthy = workers
        .iter()
        .filter(|w| w.health == conveyor_core::domain::worker::WorkerHealth::Healthy)
        .count();

    Json(json!({
        "status": "ok",
        "workers": workers.len(),
        "healthy_workers": healthy,
        "history": state.pool.is_some(),
    }))
}
