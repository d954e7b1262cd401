//! Job execution coordinator
//!
//! Accepts dispatched jobs up to the worker's capacity and runs each one in
//! its own supervision task. The task owns the job's container handle and
//! races completion against the job timeout and an explicit cancel signal;
//! whichever wins, exactly one terminal report is produced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_core::domain::job::JobReason;
use conveyor_core::dto::job::{DispatchAck, JobSpec, TerminalReport};
use conveyor_core::dto::worker::HeldAttempt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::report::Reporter;
use crate::runtime::{ContainerHandle, ContainerRuntime, RuntimeError, container_name};

/// Why a dispatch was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    #[error("worker is at capacity ({0} jobs)")]
    AtCapacity(u32),

    #[error("job {job_id} is already running attempt {running}, got attempt {offered}")]
    StaleAttempt {
        job_id: Uuid,
        running: u32,
        offered: u32,
    },
}

/// A job currently held by this worker, as shown by the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RunningJob {
    pub job_id: Uuid,
    pub attempt: u32,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    job: RunningJob,
    /// Taken by the first cancel request
    cancel: Option<oneshot::Sender<()>>,
}

/// How the supervised container ended
enum Outcome {
    Exited(i32),
    TimedOut(Duration),
    Canceled,
    Broken(RuntimeError),
}

pub struct JobCoordinator {
    worker_id: String,
    capacity: u32,
    default_timeout: Duration,
    slots: Arc<Semaphore>,
    running: Mutex<HashMap<Uuid, Entry>>,
    runtime: Arc<dyn ContainerRuntime>,
    reporter: Arc<dyn Reporter>,
}

impl JobCoordinator {
    pub fn new(
        worker_id: String,
        capacity: u32,
        default_timeout: Duration,
        runtime: Arc<dyn ContainerRuntime>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            worker_id,
            capacity,
            default_timeout,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            running: Mutex::new(HashMap::new()),
            runtime,
            reporter,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots currently occupied, including jobs still shutting down
    pub fn load(&self) -> u32 {
        let free = self.slots.available_permits() as u32;
        self.capacity.saturating_sub(free)
    }

    /// Attempts held here, from acceptance until their report is delivered
    pub fn held(&self) -> Vec<HeldAttempt> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running
            .values()
            .map(|e| HeldAttempt {
                job_id: e.job.job_id,
                attempt: e.job.attempt,
            })
            .collect()
    }

    /// Jobs currently held, oldest first
    pub fn running(&self) -> Vec<RunningJob> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let mut jobs: Vec<RunningJob> = running.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Takes a dispatched job and starts supervising it
    ///
    /// A repeat of the attempt already running is acknowledged without a
    /// second copy. A newer attempt of a job still held here supersedes it.
    pub fn accept(self: &Arc<Self>, spec: JobSpec) -> Result<DispatchAck, AcceptError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = running.get(&spec.job_id) {
            if entry.job.attempt == spec.attempt {
                debug!(
                    "Job {} attempt {} already running, acknowledging duplicate dispatch",
                    spec.job_id, spec.attempt
                );
                return Ok(DispatchAck {
                    job_id: spec.job_id,
                    attempt: spec.attempt,
                    already_running: true,
                });
            }
            if entry.job.attempt > spec.attempt {
                return Err(AcceptError::StaleAttempt {
                    job_id: spec.job_id,
                    running: entry.job.attempt,
                    offered: spec.attempt,
                });
            }
        }

        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| AcceptError::AtCapacity(self.capacity))?;

        if let Some(mut old) = running.remove(&spec.job_id) {
            info!(
                "Job {} attempt {} superseded by attempt {}",
                spec.job_id, old.job.attempt, spec.attempt
            );
            if let Some(cancel) = old.cancel.take() {
                let _ = cancel.send(());
            }
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        running.insert(
            spec.job_id,
            Entry {
                job: RunningJob {
                    job_id: spec.job_id,
                    attempt: spec.attempt,
                    name: spec.name.clone(),
                    started_at: Utc::now(),
                },
                cancel: Some(cancel_tx),
            },
        );
        drop(running);

        info!(
            "Accepted job {} '{}' (attempt {}, image {})",
            spec.job_id, spec.name, spec.attempt, spec.image
        );

        let ack = DispatchAck {
            job_id: spec.job_id,
            attempt: spec.attempt,
            already_running: false,
        };

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.supervise(spec, permit, cancel_rx).await;
        });

        Ok(ack)
    }

    /// Signals a running job to stop
    ///
    /// Idempotent; returns false when nothing was signalled.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        match running.get_mut(&job_id).and_then(|e| e.cancel.take()) {
            Some(cancel) => {
                info!("Canceling job {}", job_id);
                cancel.send(()).is_ok()
            }
            None => {
                debug!("Cancel for job {} ignored: not running here", job_id);
                false
            }
        }
    }

    async fn supervise(&self, spec: JobSpec, permit: OwnedSemaphorePermit, cancel: oneshot::Receiver<()>) {
        let report = self.execute(&spec, cancel).await;
        drop(permit);

        if !self.reporter.deliver(&report).await {
            error!(
                "Terminal report for job {} (attempt {}) was not delivered",
                spec.job_id, spec.attempt
            );
        }

        // Held until delivery; a heartbeat without it tells the orchestrator the report is lost
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running
            .get(&spec.job_id)
            .is_some_and(|e| e.job.attempt == spec.attempt)
        {
            running.remove(&spec.job_id);
        }
    }

    async fn execute(&self, spec: &JobSpec, mut cancel: oneshot::Receiver<()>) -> TerminalReport {
        let timeout = spec
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        // The deadline and the cancel signal cover the image pull too.
        // A dropped sender counts as a cancel.
        let name = container_name(spec.job_id, spec.attempt);
        let created = tokio::select! {
            created = tokio::time::timeout_at(deadline, self.runtime.create(&name, &spec.image, &spec.script)) => {
                match created {
                    Ok(Ok(handle)) => Ok(handle),
                    Ok(Err(e)) => {
                        error!("Failed to start container for job {}: {}", spec.job_id, e);
                        return TerminalReport::failed(
                            spec,
                            &self.worker_id,
                            None,
                            JobReason::Infrastructure {
                                message: e.to_string(),
                            },
                        );
                    }
                    Err(_) => Err(Outcome::TimedOut(timeout)),
                }
            }
            _ = &mut cancel => Err(Outcome::Canceled),
        };

        let outcome = match created {
            Ok(handle) => self.supervise_container(&handle, deadline, timeout, &mut cancel).await,
            Err(outcome) => {
                // The abandoned create may have left a container behind
                let partial = ContainerHandle {
                    name: name.clone(),
                    id: String::new(),
                };
                if let Err(e) = self.runtime.remove(&partial).await {
                    debug!("Nothing to clean up for container {}: {}", name, e);
                }
                outcome
            }
        };

        match outcome {
            Outcome::Exited(0) => {
                info!("Job {} succeeded", spec.job_id);
                TerminalReport::succeeded(spec, &self.worker_id)
            }
            Outcome::Exited(exit_code) => {
                info!("Job {} failed with exit code {}", spec.job_id, exit_code);
                TerminalReport::failed(
                    spec,
                    &self.worker_id,
                    Some(exit_code),
                    JobReason::CommandFailed { exit_code },
                )
            }
            Outcome::TimedOut(after) => {
                warn!("Job {} timed out after {:?}", spec.job_id, after);
                TerminalReport::failed(
                    spec,
                    &self.worker_id,
                    None,
                    JobReason::Timeout {
                        after_seconds: after.as_secs(),
                    },
                )
            }
            Outcome::Canceled => {
                info!("Job {} canceled", spec.job_id);
                TerminalReport::canceled(spec, &self.worker_id, "canceled on request")
            }
            Outcome::Broken(e) => {
                error!("Container runtime failed for job {}: {}", spec.job_id, e);
                TerminalReport::failed(
                    spec,
                    &self.worker_id,
                    None,
                    JobReason::Infrastructure {
                        message: e.to_string(),
                    },
                )
            }
        }
    }

    /// Waits for a started container, then stops and removes it
    async fn supervise_container(
        &self,
        handle: &ContainerHandle,
        deadline: tokio::time::Instant,
        timeout: Duration,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Outcome {
        let outcome = tokio::select! {
            waited = tokio::time::timeout_at(deadline, self.runtime.wait(handle)) => match waited {
                Ok(Ok(exit_code)) => Outcome::Exited(exit_code),
                Ok(Err(e)) => Outcome::Broken(e),
                Err(_) => Outcome::TimedOut(timeout),
            },
            _ = cancel => Outcome::Canceled,
        };

        if matches!(outcome, Outcome::TimedOut(_) | Outcome::Canceled) {
            if let Err(e) = self.runtime.stop(handle).await {
                warn!("Failed to stop container {}: {}", handle.name, e);
            }
        }

        if let Err(e) = self.runtime.remove(handle).await {
            warn!("Failed to remove container {}: {}", handle.name, e);
        }

        outcome
    }
}
