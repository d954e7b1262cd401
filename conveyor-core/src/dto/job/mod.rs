//! Job DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{JobReason, JobRun};
use crate::domain::status::JobStatus;

/// Everything a worker needs to run one attempt of a job
///
/// Sent by the orchestrator in the dispatch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: Uuid,
    pub pipeline_id: Uuid,
    /// Attempt number; reports for older attempts are ignored
    pub attempt: u32,
    pub name: String,
    pub image: String,
    pub script: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

impl JobSpec {
    /// Builds the spec for the job's current attempt
    pub fn for_job(pipeline_id: Uuid, job: &JobRun) -> Self {
        Self {
            job_id: job.id,
            pipeline_id,
            attempt: job.attempt,
            name: job.name.clone(),
            image: job.image.clone(),
            script: job.script.clone(),
            timeout_seconds: job.timeout_seconds,
        }
    }
}

/// Worker's acknowledgement of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAck {
    pub job_id: Uuid,
    pub attempt: u32,
    /// True when the job was already running here and no second copy was started
    pub already_running: bool,
}

/// Terminal outcome reported by a worker
///
/// Safe to deliver more than once: the orchestrator applies it with
/// compare-and-swap semantics and ignores duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalReport {
    pub job_id: Uuid,
    pub attempt: u32,
    pub worker_id: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<JobReason>,
}

impl TerminalReport {
    pub fn succeeded(spec: &JobSpec, worker_id: &str) -> Self {
        Self {
            job_id: spec.job_id,
            attempt: spec.attempt,
            worker_id: worker_id.to_string(),
            status: JobStatus::Succeeded,
            exit_code: Some(0),
            reason: None,
        }
    }

    pub fn failed(spec: &JobSpec, worker_id: &str, exit_code: Option<i32>, reason: JobReason) -> Self {
        Self {
            job_id: spec.job_id,
            attempt: spec.attempt,
            worker_id: worker_id.to_string(),
            status: JobStatus::Failed,
            exit_code,
            reason: Some(reason),
        }
    }

    pub fn canceled(spec: &JobSpec, worker_id: &str, message: impl Into<String>) -> Self {
        Self {
            job_id: spec.job_id,
            attempt: spec.attempt,
            worker_id: worker_id.to_string(),
            status: JobStatus::Canceled,
            exit_code: None,
            reason: Some(JobReason::Canceled {
                message: message.into(),
            }),
        }
    }
}

/// Orchestrator's answer to a terminal report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAck {
    /// False when the report was a stale duplicate
    pub applied: bool,
}
