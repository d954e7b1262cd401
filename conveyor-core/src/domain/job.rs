//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::status::JobStatus;

/// Job instance
///
/// One per job definition, created together with its pipeline run. The
/// orchestrator mutates it; workers and clients only ever see copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub stage_id: Uuid,
    pub name: String,
    pub image: String,
    pub script: Vec<String>,
    /// Indices of dependencies within the owning stage's job list
    pub depends_on: Vec<usize>,
    pub status: JobStatus,
    /// Worker holding this job, set while Dispatching or Running
    pub worker_id: Option<String>,
    /// Incremented every time the job is handed to a worker
    pub attempt: u32,
    /// Execution failures consumed from the retry budget
    pub retry_count: u32,
    pub max_retries: u32,
    /// Infrastructure failures retried outside the retry budget
    pub infra_retries: u32,
    pub timeout_seconds: Option<u64>,
    pub allow_failure: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Why the job last failed or was canceled
    pub reason: Option<JobReason>,
}

impl JobRun {
    /// Whether a retry budget remains for an execution failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Structured reason attached to a failed, retried or canceled job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReason {
    /// The job's command exited with a nonzero code
    CommandFailed { exit_code: i32 },
    /// The container runtime failed (image pull, runtime crash)
    Infrastructure { message: String },
    /// The job exceeded its allotted runtime
    Timeout { after_seconds: u64 },
    /// The worker holding the job stopped sending heartbeats, or stopped
    /// holding the attempt without its report arriving
    WorkerLost { worker_id: String },
    /// Canceled by request or by a failure cascade
    Canceled { message: String },
}

impl JobReason {
    /// Infrastructure failures are retried without touching the job's own budget.
    pub fn consumes_retry_budget(&self) -> bool {
        !matches!(self, JobReason::Infrastructure { .. })
    }
}

impl std::fmt::Display for JobReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobReason::CommandFailed { exit_code } => {
                write!(f, "command exited with code {}", exit_code)
            }
            JobReason::Infrastructure { message } => write!(f, "infrastructure error: {}", message),
            JobReason::Timeout { after_seconds } => write!(f, "timed out after {}s", after_seconds),
            JobReason::WorkerLost { worker_id } => write!(f, "worker {} lost", worker_id),
            JobReason::Canceled { message } => write!(f, "canceled: {}", message),
        }
    }
}
