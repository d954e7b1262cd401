//! Worker domain model
//!
//! Represents a worker node that executes jobs dispatched by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker that can execute jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier for the worker
    pub id: String,

    /// Base URL the orchestrator uses to reach the worker
    pub address: String,

    /// Maximum number of concurrent jobs
    pub capacity: u32,

    /// Jobs the orchestrator has assigned to this worker (Dispatching or Running)
    pub load: u32,

    /// Load the worker itself reported in its last heartbeat
    pub reported_load: u32,

    /// Current health of the worker
    pub health: WorkerHealth,

    /// Heartbeat intervals elapsed since the last heartbeat
    pub missed_heartbeats: u32,

    /// When this worker was first seen
    pub registered_at: DateTime<Utc>,

    /// Last time this worker sent a heartbeat
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Worker {
    /// Slots still available for dispatch
    pub fn free_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }
}

/// Health of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerHealth {
    /// Heartbeats arrive on time; eligible for dispatch
    Healthy,

    /// Missed heartbeats or a failed dispatch; not eligible for dispatch
    Suspect,

    /// Presumed gone; its running jobs have been failed
    Dead,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Healthy => write!(f, "Healthy"),
            WorkerHealth::Suspect => write!(f, "Suspect"),
            WorkerHealth::Dead => write!(f, "Dead"),
        }
    }
}
