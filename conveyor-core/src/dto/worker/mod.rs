//! Worker DTOs
//!
//! Data transfer objects for worker-related operations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Periodic liveness signal from a worker
///
/// The first heartbeat from an unknown worker registers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Unique identifier for the worker
    pub worker_id: String,

    /// Base URL the orchestrator uses for dispatch and cancel calls
    pub address: String,

    /// Maximum number of concurrent jobs
    pub capacity: u32,

    /// Jobs currently executing on the worker
    pub current_load: u32,

    /// Attempts the worker still holds, including those whose report is in flight
    #[serde(default)]
    pub held: Vec<HeldAttempt>,
}

/// One job attempt held by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeldAttempt {
    pub job_id: Uuid,
    pub attempt: u32,
}
