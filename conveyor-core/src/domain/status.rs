//! Status enums and their transition tables
//!
//! Every entity kind has a closed set of statuses. Allowed moves are listed
//! explicitly in `can_transition_to`; anything not listed is rejected.

use serde::{Deserialize, Serialize};

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for its dependencies or for a worker slot
    Pending,
    /// A worker slot is reserved and the dispatch call is in flight
    Dispatching,
    /// The worker acknowledged the dispatch
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Statuses that hold a slot on the assigned worker.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Dispatching | JobStatus::Running)
    }

    /// Transition table for jobs.
    ///
    /// A retry is folded into a single move back to `Pending` (from either
    /// active status), so `Failed` is only ever written once the retry budget
    /// is exhausted. `Dispatching` may go straight to a terminal status when
    /// the worker reports before the dispatch acknowledgement is applied.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Pending, Dispatching | Canceled) => true,
            (Dispatching, Running | Pending | Succeeded | Failed | Canceled) => true,
            (Running, Succeeded | Failed | Canceled | Pending) => true,
            _ => false,
        }
    }
}

/// Stage status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Canceled
        )
    }

    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;

        match (self, next) {
            (Pending, Running | Canceled) => true,
            (Running, Succeeded | Failed | Canceled) => true,
            _ => false,
        }
    }
}

/// Pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Succeeded | PipelineStatus::Failed | PipelineStatus::Canceled
        )
    }

    pub fn can_transition_to(self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;

        match (self, next) {
            (Pending, Running | Canceled) => true,
            (Running, Succeeded | Failed | Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Dispatching => write!(f, "Dispatching"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Succeeded => write!(f, "Succeeded"),
            JobStatus::Failed => write!(f, "Failed"),
            JobStatus::Canceled => write!(f, "Canceled"),
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "Pending"),
            StageStatus::Running => write!(f, "Running"),
            StageStatus::Succeeded => write!(f, "Succeeded"),
            StageStatus::Failed => write!(f, "Failed"),
            StageStatus::Canceled => write!(f, "Canceled"),
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Pending => write!(f, "Pending"),
            PipelineStatus::Running => write!(f, "Running"),
            PipelineStatus::Succeeded => write!(f, "Succeeded"),
            PipelineStatus::Failed => write!(f, "Failed"),
            PipelineStatus::Canceled => write!(f, "Canceled"),
        }
    }
}
