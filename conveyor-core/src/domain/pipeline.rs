//! Pipeline domain types
//!
//! Two families of types live here: the definition a user submits (already
//! parsed from whatever textual syntax the client uses) and the run instance
//! the orchestrator creates from a validated definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::JobRun;
use crate::domain::stage::StageRun;
use crate::domain::status::PipelineStatus;

// =============================================================================
// Definitions
// =============================================================================

/// Pipeline definition as submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

/// Stage definition (ordered within the pipeline)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub allow_failure: bool,
    pub jobs: Vec<JobDefinition>,
}

/// Job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    /// Container image the job runs in
    pub image: String,
    /// Commands executed in order; the first failing command fails the job
    pub script: Vec<String>,
    /// Names of jobs in the same stage that must finish first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub max_retries: u32,
    /// Per-job execution timeout; the worker default applies when unset
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl JobDefinition {
    /// Creates a job definition with defaults for the optional fields
    pub fn new(name: impl Into<String>, image: impl Into<String>, script: Vec<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            script,
            depends_on: Vec::new(),
            allow_failure: false,
            max_retries: 0,
            timeout_seconds: None,
        }
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Pipeline instance
///
/// Owned exclusively by the orchestrator's execution store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub name: String,
    pub status: PipelineStatus,
    pub stages: Vec<StageRun>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Index of the stage currently executing, if any
    pub fn active_stage(&self) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.status == crate::domain::status::StageStatus::Running)
    }

    /// Finds a job instance by ID
    pub fn job(&self, job_id: Uuid) -> Option<&JobRun> {
        self.stages
            .iter()
            .flat_map(|s| s.jobs.iter())
            .find(|j| j.id == job_id)
    }

    /// Total number of job instances across all stages
    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|s| s.jobs.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_defaults_from_json() {
        let json = serde_json::json!({
            "name": "ci",
            "stages": [{
                "name": "build",
                "jobs": [{ "name": "compile", "image": "rust:1", "script": ["cargo build"] }]
            }]
        });

        let def: PipelineDefinition = serde_json::from_value(json).unwrap();
        let job = &def.stages[0].jobs[0];
        assert!(!def.stages[0].allow_failure);
        assert!(job.depends_on.is_empty());
        assert_eq!(job.max_retries, 0);
        assert_eq!(job.timeout_seconds, None);
        assert_eq!(job, &JobDefinition::new("compile", "rust:1", vec!["cargo build".to_string()]));
    }
}
