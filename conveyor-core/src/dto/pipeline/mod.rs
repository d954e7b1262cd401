//! Pipeline DTOs for inter-service communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pipeline::PipelineRun;
use crate::domain::status::PipelineStatus;

/// Response to a successful submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCreated {
    pub id: Uuid,
}

/// Lightweight pipeline run summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: Uuid,
    pub name: String,
    pub status: PipelineStatus,
    pub stage_count: usize,
    pub job_count: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PipelineRun> for PipelineSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            id: run.id,
            name: run.name.clone(),
            status: run.status,
            stage_count: run.stages.len(),
            job_count: run.job_count(),
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}
