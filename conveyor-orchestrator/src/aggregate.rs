//! Status aggregation
//!
//! Pure functions deriving a stage's status from its jobs and a pipeline's
//! status from its stages.

use conveyor_core::domain::stage::StageRun;
use conveyor_core::domain::status::{JobStatus, PipelineStatus, StageStatus};

/// Status a running stage should have given its jobs
///
/// - FAILED as soon as any job whose failure is not allowed has FAILED
/// - otherwise RUNNING until every job is terminal
/// - then CANCELED if a job whose failure is not allowed was canceled,
///   else SUCCEEDED
pub fn stage_status(stage: &StageRun) -> StageStatus {
    let mut all_terminal = true;
    let mut canceled = false;

    for (idx, job) in stage.jobs.iter().enumerate() {
        let allowed = stage.failure_allowed(idx);
        match job.status {
            JobStatus::Failed if !allowed => return StageStatus::Failed,
            JobStatus::Canceled if !allowed => canceled = true,
            status if !status.is_terminal() => all_terminal = false,
            _ => {}
        }
    }

    if !all_terminal {
        StageStatus::Running
    } else if canceled {
        StageStatus::Canceled
    } else {
        StageStatus::Succeeded
    }
}

/// Status a pipeline should have given its stages
///
/// A terminal `current` status is returned unchanged.
pub fn pipeline_status(current: PipelineStatus, stages: &[StageRun]) -> PipelineStatus {
    if current.is_terminal() {
        return current;
    }

    if stages.iter().any(|s| s.status == StageStatus::Failed) {
        return PipelineStatus::Failed;
    }
    if stages.iter().any(|s| s.status == StageStatus::Canceled) {
        return PipelineStatus::Canceled;
    }
    if stages.last().is_some_and(|s| s.status == StageStatus::Succeeded) {
        return PipelineStatus::Succeeded;
    }
    if stages
        .iter()
        .any(|s| matches!(s.status, StageStatus::Running | StageStatus::Succeeded))
    {
        return PipelineStatus::Running;
    }

    PipelineStatus::Pending
}
