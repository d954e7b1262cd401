//! Dispatcher
//!
//! The RPC seam between the control plane and worker nodes. The scheduler
//! only sees [`WorkerRpc`]; production uses [`HttpWorkerRpc`].

use std::time::Duration;

use async_trait::async_trait;
use conveyor_client::{ClientError, WorkerClient};
use conveyor_core::dto::job::{DispatchAck, JobSpec};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::WorkerTarget;

/// Transient failure to hand a job to a worker
///
/// Never surfaced to submitters: the job goes back to PENDING.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker {0} is at capacity")]
    Rejected(String),

    #[error("worker {worker} did not answer within {after:?}")]
    Timeout { worker: String, after: Duration },

    #[error("worker {worker} unreachable: {message}")]
    Transport { worker: String, message: String },
}

/// Calls made by the control plane on a worker
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Hands one job attempt to the worker
    async fn dispatch(&self, target: &WorkerTarget, spec: &JobSpec) -> Result<DispatchAck, DispatchError>;

    /// Asks the worker to stop a job
    async fn cancel(&self, target: &WorkerTarget, job_id: Uuid) -> Result<(), DispatchError>;
}

/// [`WorkerRpc`] over HTTP, sharing one connection pool across workers
pub struct HttpWorkerRpc {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpWorkerRpc {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn worker(&self, target: &WorkerTarget) -> WorkerClient {
        WorkerClient::with_client(target.address.clone(), self.client.clone())
    }

    fn map_error(&self, target: &WorkerTarget, err: ClientError) -> DispatchError {
        if err.is_conflict() {
            DispatchError::Rejected(target.id.clone())
        } else if err.is_timeout() {
            DispatchError::Timeout {
                worker: target.id.clone(),
                after: self.timeout,
            }
        } else {
            DispatchError::Transport {
                worker: target.id.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl WorkerRpc for HttpWorkerRpc {
    async fn dispatch(&self, target: &WorkerTarget, spec: &JobSpec) -> Result<DispatchAck, DispatchError> {
        self.worker(target)
            .dispatch(spec, self.timeout)
            .await
            .map_err(|e| self.map_error(target, e))
    }

    async fn cancel(&self, target: &WorkerTarget, job_id: Uuid) -> Result<(), DispatchError> {
        self.worker(target)
            .cancel(job_id, self.timeout)
            .await
            .map_err(|e| self.map_error(target, e))
    }
}
