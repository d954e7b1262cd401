//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline submission, inspection and cancellation.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use conveyor_core::domain::pipeline::{PipelineDefinition, PipelineRun};
use conveyor_core::dto::pipeline::{PipelineCreated, PipelineSummary};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::repository::run_repository;

/// POST /pipelines
/// Validate and submit a pipeline definition
pub async fn submit_pipeline(
    State(state): State<AppState>,
    Json(def): Json<PipelineDefinition>,
) -> ApiResult<(StatusCode, Json<PipelineCreated>)> {
    tracing::info!("Submitting pipeline: {}", def.name);

    let id = state.scheduler.submit(&def).map_err(|errors| {
        tracing::info!("Pipeline {} rejected: {}", def.name, errors);
        ApiError::from(errors)
    })?;

    Ok((StatusCode::CREATED, Json(PipelineCreated { id })))
}

/// GET /pipelines
/// List summaries of all runs
pub async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<PipelineSummary>> {
    tracing::debug!("Listing all pipelines");
    Json(state.scheduler.summaries())
}

/// GET /pipelines/{id}
/// Read-only snapshot of a run
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting pipeline: {}", id);

    state
        .scheduler
        .snapshot(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Pipeline {} not found", id)))
}

/// POST /pipelines/{id}/cancel
/// Cancel a run and everything still pending or running in it
pub async fn cancel_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Canceling pipeline: {}", id);

    match state.scheduler.cancel_pipeline(id) {
        Some(true) => Ok(StatusCode::ACCEPTED),
        Some(false) => Err(ApiError::Conflict(format!("Pipeline {} already finished", id))),
        None => Err(ApiError::NotFound(format!("Pipeline {} not found", id))),
    }
}

/// GET /pipelines/history/{name}
/// Past runs of a pipeline, from the database when one is configured
pub async fn pipeline_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<PipelineSummary>>> {
    tracing::debug!("Getting history of pipeline: {}", name);

    let runs = match &state.pool {
        Some(pool) => run_repository::find_by_name(pool, &name).await?,
        None => state.scheduler.history(&name),
    };

    Ok(Json(runs))
}
