//! Job API Handlers
//!
//! Terminal reports from workers.

use axum::{
    Json,
    extract::{Path, State},
};
use conveyor_core::dto::job::{ReportAck, TerminalReport};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// POST /jobs/{id}/report
/// Apply a worker's terminal report; repeat-safe
pub async fn report_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<TerminalReport>,
) -> ApiResult<Json<ReportAck>> {
    if report.job_id != id {
        return Err(ApiError::BadRequest(format!(
            "Report for job {} posted to job {}",
            report.job_id, id
        )));
    }
    if !report.status.is_terminal() {
        return Err(ApiError::BadRequest(format!(
            "Report status must be terminal, got {}",
            report.status
        )));
    }

    tracing::debug!(
        "Report for job {} (attempt {}) from {}: {}",
        id,
        report.attempt,
        report.worker_id,
        report.status
    );

    let applied = state
        .scheduler
        .report(&report)
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;

    Ok(Json(ReportAck { applied }))
}
