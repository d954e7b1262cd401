//! Stage domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::JobRun;
use crate::domain::status::StageStatus;

/// Stage instance
///
/// Stages of a pipeline run execute strictly in `index` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    /// Position within the pipeline, contiguous from 0
    pub index: usize,
    pub name: String,
    pub status: StageStatus,
    /// A failed job in this stage neither fails the stage nor blocks the next one
    pub allow_failure: bool,
    pub jobs: Vec<JobRun>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRun {
    /// Whether a failure of the job at `job` may be ignored for rollup purposes
    pub fn failure_allowed(&self, job: usize) -> bool {
        self.allow_failure || self.jobs.get(job).is_some_and(|j| j.allow_failure)
    }
}
