//! Execution State Store
//!
//! Authoritative in-memory state of every pipeline run. Each run sits behind
//! its own mutex, so mutations of one pipeline are serialized while
//! different pipelines proceed concurrently. No lock is ever held across an
//! `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use conveyor_core::domain::job::{JobReason, JobRun};
use conveyor_core::domain::pipeline::PipelineRun;
use conveyor_core::domain::stage::StageRun;
use conveyor_core::domain::status::{JobStatus, PipelineStatus, StageStatus};
use conveyor_core::dto::pipeline::PipelineSummary;
use conveyor_core::model::ValidatedPipeline;
use uuid::Uuid;

use crate::aggregate;

/// Where a job lives inside its pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLocation {
    pub pipeline_id: Uuid,
    pub stage: usize,
    pub job: usize,
}

/// Extra data carried by a job transition
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    /// When set, the transition only applies to this attempt
    pub attempt: Option<u32>,
    /// Worker taking the job; used when entering DISPATCHING
    pub worker_id: Option<String>,
    pub exit_code: Option<i32>,
    pub reason: Option<JobReason>,
}

/// Result of recomputing a pipeline's stage and pipeline statuses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollup {
    pub pipeline: PipelineStatus,
    pub stages: Vec<StageStatus>,
    /// The pipeline status changed during this rollup
    pub changed: bool,
}

#[derive(Default)]
pub struct ExecutionStore {
    pipelines: RwLock<HashMap<Uuid, Arc<Mutex<PipelineRun>>>>,
    jobs: RwLock<HashMap<Uuid, JobLocation>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates PENDING instances for a validated definition
    pub fn create_instances(&self, validated: &ValidatedPipeline) -> Uuid {
        let pipeline_id = Uuid::new_v4();
        let mut locations = Vec::new();

        let stages = validated
            .stages()
            .iter()
            .enumerate()
            .map(|(stage_idx, stage)| {
                let stage_id = Uuid::new_v4();
                let jobs = stage
                    .jobs()
                    .iter()
                    .enumerate()
                    .map(|(job_idx, def)| {
                        let job = JobRun {
                            id: Uuid::new_v4(),
                            stage_id,
                            name: def.name.clone(),
                            image: def.image.clone(),
                            script: def.script.clone(),
                            depends_on: stage.graph().dependencies_of(job_idx).to_vec(),
                            status: JobStatus::Pending,
                            worker_id: None,
                            attempt: 0,
                            retry_count: 0,
                            max_retries: def.max_retries,
                            infra_retries: 0,
                            timeout_seconds: def.timeout_seconds,
                            allow_failure: def.allow_failure,
                            started_at: None,
                            completed_at: None,
                            exit_code: None,
                            reason: None,
                        };
                        locations.push((
                            job.id,
                            JobLocation {
                                pipeline_id,
                                stage: stage_idx,
                                job: job_idx,
                            },
                        ));
                        job
                    })
                    .collect();

                StageRun {
                    id: stage_id,
                    pipeline_id,
                    index: stage_idx,
                    name: stage.name().to_string(),
                    status: StageStatus::Pending,
                    allow_failure: stage.allow_failure(),
                    jobs,
                    started_at: None,
                    completed_at: None,
                }
            })
            .collect();

        let run = PipelineRun {
            id: pipeline_id,
            name: validated.name().to_string(),
            status: PipelineStatus::Pending,
            stages,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        // Index jobs before publishing the run so a lookup never misses
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(locations);
        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pipeline_id, Arc::new(Mutex::new(run)));

        pipeline_id
    }

    fn entry(&self, pipeline_id: Uuid) -> Option<Arc<Mutex<PipelineRun>>> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pipeline_id)
            .cloned()
    }

    /// Runs `f` inside the pipeline's serialized section
    pub fn with_pipeline<R>(
        &self,
        pipeline_id: Uuid,
        f: impl FnOnce(&mut PipelineRun) -> R,
    ) -> Option<R> {
        let entry = self.entry(pipeline_id)?;
        let mut run = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut run))
    }

    pub fn locate(&self, job_id: Uuid) -> Option<JobLocation> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .copied()
    }

    /// Jobs that may be dispatched right now
    pub fn runnable_jobs(&self, pipeline_id: Uuid) -> Vec<JobRun> {
        self.with_pipeline(pipeline_id, |run| {
            runnable(run)
                .into_iter()
                .map(|(s, j)| run.stages[s].jobs[j].clone())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Compare-and-swap a job's status, then recompute the rollup
    ///
    /// Returns false on a status or attempt mismatch, or for an unknown job.
    pub fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        meta: TransitionMeta,
    ) -> bool {
        let Some(loc) = self.locate(job_id) else {
            return false;
        };

        self.with_pipeline(loc.pipeline_id, |run| {
            let applied = apply_transition(&mut run.stages[loc.stage].jobs[loc.job], from, to, meta);
            if applied {
                rollup(run);
            }
            applied
        })
        .unwrap_or(false)
    }

    pub fn recompute(&self, pipeline_id: Uuid) -> Option<Rollup> {
        self.with_pipeline(pipeline_id, rollup)
    }

    /// Read-only copy of a pipeline run
    pub fn snapshot(&self, pipeline_id: Uuid) -> Option<PipelineRun> {
        self.with_pipeline(pipeline_id, |run| run.clone())
    }

    fn entries(&self) -> Vec<Arc<Mutex<PipelineRun>>> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Summaries of every run, newest first
    pub fn summaries(&self) -> Vec<PipelineSummary> {
        let mut summaries: Vec<PipelineSummary> = self
            .entries()
            .iter()
            .map(|entry| PipelineSummary::from(&*entry.lock().unwrap_or_else(PoisonError::into_inner)))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Summaries of runs of the pipeline named `name`, newest first
    pub fn history(&self, name: &str) -> Vec<PipelineSummary> {
        self.summaries()
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }

    /// IDs of runs that are not yet terminal
    pub fn active_pipelines(&self) -> Vec<Uuid> {
        self.entries()
            .iter()
            .filter_map(|entry| {
                let run = entry.lock().unwrap_or_else(PoisonError::into_inner);
                (!run.status.is_terminal()).then_some(run.id)
            })
            .collect()
    }

    /// Active jobs assigned to a worker, with their status and attempt
    pub fn jobs_on_worker(&self, worker_id: &str) -> Vec<(Uuid, JobStatus, u32)> {
        self.entries()
            .iter()
            .flat_map(|entry| {
                let run = entry.lock().unwrap_or_else(PoisonError::into_inner);
                run.stages
                    .iter()
                    .flat_map(|s| s.jobs.iter())
                    .filter(|j| j.status.is_active() && j.worker_id.as_deref() == Some(worker_id))
                    .map(|j| (j.id, j.status, j.attempt))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

// =============================================================================
// Serialized-section helpers
// =============================================================================

/// Whether the dependency at `dep` of `stage` no longer blocks its dependents
fn dependency_satisfied(stage: &StageRun, dep: usize) -> bool {
    match stage.jobs.get(dep).map(|j| j.status) {
        Some(JobStatus::Succeeded) => true,
        Some(JobStatus::Failed) => stage.failure_allowed(dep),
        _ => false,
    }
}

/// (stage, job) indices of PENDING jobs in the running stage whose
/// dependencies are all satisfied
pub fn runnable(run: &PipelineRun) -> Vec<(usize, usize)> {
    if run.status != PipelineStatus::Running {
        return Vec::new();
    }
    let Some(stage_idx) = run.active_stage() else {
        return Vec::new();
    };
    let stage = &run.stages[stage_idx];

    stage
        .jobs
        .iter()
        .enumerate()
        .filter(|(_, job)| job.status == JobStatus::Pending)
        .filter(|(_, job)| job.depends_on.iter().all(|&d| dependency_satisfied(stage, d)))
        .map(|(idx, _)| (stage_idx, idx))
        .collect()
}

/// Compare-and-swap on a single job
pub fn apply_transition(job: &mut JobRun, from: JobStatus, to: JobStatus, meta: TransitionMeta) -> bool {
    if job.status != from || !from.can_transition_to(to) {
        return false;
    }
    if meta.attempt.is_some_and(|a| a != job.attempt) {
        return false;
    }

    let now = Utc::now();
    match to {
        JobStatus::Dispatching => {
            job.attempt += 1;
            job.worker_id = meta.worker_id;
            job.exit_code = None;
        }
        JobStatus::Running => {
            job.started_at = Some(now);
        }
        JobStatus::Pending => {
            job.worker_id = None;
            job.exit_code = meta.exit_code;
            if meta.reason.is_some() {
                job.reason = meta.reason;
            }
        }
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled => {
            job.completed_at = Some(now);
            job.exit_code = meta.exit_code;
            job.reason = meta.reason;
        }
    }

    job.status = to;
    true
}

/// Recomputes stage and pipeline statuses, starting the next stage when the
/// previous one succeeded
pub fn rollup(run: &mut PipelineRun) -> Rollup {
    let now = Utc::now();
    let before = run.status;

    for stage in run.stages.iter_mut() {
        if stage.status != StageStatus::Running {
            continue;
        }
        let next = aggregate::stage_status(stage);
        if next != stage.status && stage.status.can_transition_to(next) {
            stage.status = next;
            stage.completed_at = Some(now);
        }
    }

    if run.status == PipelineStatus::Running {
        let blocked = run
            .stages
            .iter()
            .any(|s| matches!(s.status, StageStatus::Failed | StageStatus::Canceled));
        if !blocked {
            if let Some(next) = run.stages.iter_mut().find(|s| s.status != StageStatus::Succeeded) {
                if next.status == StageStatus::Pending {
                    next.status = StageStatus::Running;
                    next.started_at = Some(now);
                }
            }
        }
    }

    let status = aggregate::pipeline_status(run.status, &run.stages);
    if status != run.status && run.status.can_transition_to(status) {
        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(now);
        }
    }

    Rollup {
        pipeline: run.status,
        stages: run.stages.iter().map(|s| s.status).collect(),
        changed: run.status != before,
    }
}
