//! Pipeline state machine
//!
//! Every function here runs inside a pipeline's serialized section and only
//! touches the run it is given. Side effects on the outside world (worker
//! slots, cancel RPCs, waking the scheduler, history) are returned as
//! [`Effects`] and applied by the caller after the lock is released.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use conveyor_core::domain::job::{JobReason, JobRun};
use conveyor_core::domain::pipeline::PipelineRun;
use conveyor_core::domain::status::{JobStatus, PipelineStatus, StageStatus};
use conveyor_core::dto::job::{JobSpec, TerminalReport};
use conveyor_core::dto::worker::HeldAttempt;
use uuid::Uuid;

use crate::store::{JobLocation, TransitionMeta, apply_transition, rollup};

/// Best-effort cancel to send once the lock is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub worker_id: String,
    pub job_id: Uuid,
}

/// Work to do outside the serialized section
#[derive(Debug, Default)]
pub struct Effects {
    /// Workers whose reserved slot is now free
    pub release: Vec<String>,
    pub cancels: Vec<CancelRequest>,
    /// Something became runnable
    pub wake: bool,
    /// Copy of the run, taken when its pipeline status changed
    pub snapshot: Option<PipelineRun>,
}

impl Effects {
    fn merge(&mut self, other: Effects) {
        self.release.extend(other.release);
        self.cancels.extend(other.cancels);
        self.wake |= other.wake;
        if other.snapshot.is_some() {
            self.snapshot = other.snapshot;
        }
    }
}

/// Moves a job and records the slot release when it leaves an active status
fn move_job(job: &mut JobRun, from: JobStatus, to: JobStatus, meta: TransitionMeta, fx: &mut Effects) -> bool {
    let worker = job.worker_id.clone();
    let was_active = job.status.is_active();
    if !apply_transition(job, from, to, meta) {
        return false;
    }
    if was_active && !to.is_active() {
        if let Some(worker) = worker {
            fx.release.push(worker);
        }
    }
    true
}

/// Rolls up the run and reacts to a new pipeline status
fn settle(run: &mut PipelineRun, fx: &mut Effects) {
    let result = rollup(run);
    if result.pipeline == PipelineStatus::Failed && result.changed {
        cascade(run, fx, "pipeline failed");
    }
    if result.changed {
        fx.snapshot = Some(run.clone());
    }
    // A finished job or a freshly started stage may unblock work
    fx.wake = true;
}

/// Starts a PENDING pipeline: the pipeline and its first stage become RUNNING
pub fn start(run: &mut PipelineRun) -> Effects {
    let mut fx = Effects::default();
    if run.status != PipelineStatus::Pending {
        return fx;
    }

    let now = Utc::now();
    run.status = PipelineStatus::Running;
    run.started_at = Some(now);
    if let Some(first) = run.stages.first_mut() {
        first.status = StageStatus::Running;
        first.started_at = Some(now);
    }

    rollup(run);
    fx.snapshot = Some(run.clone());
    fx.wake = true;
    fx
}

/// Re-evaluates the rollup; used by the periodic sweep
pub fn advance(run: &mut PipelineRun) -> Effects {
    let mut fx = Effects::default();
    if run.status.is_terminal() {
        return fx;
    }
    let result = rollup(run);
    if result.pipeline == PipelineStatus::Failed && result.changed {
        cascade(run, &mut fx, "pipeline failed");
    }
    if result.changed {
        fx.snapshot = Some(run.clone());
        fx.wake = true;
    }
    fx
}

/// PENDING -> DISPATCHING onto a worker whose slot was already reserved
///
/// Returns the spec to send, or `None` when the job is no longer PENDING.
pub fn reserve(run: &mut PipelineRun, loc: JobLocation, worker_id: &str) -> Option<JobSpec> {
    let job = run.stages.get_mut(loc.stage)?.jobs.get_mut(loc.job)?;
    let meta = TransitionMeta {
        worker_id: Some(worker_id.to_string()),
        ..Default::default()
    };
    if !apply_transition(job, JobStatus::Pending, JobStatus::Dispatching, meta) {
        return None;
    }
    Some(JobSpec::for_job(run.id, job))
}

/// DISPATCHING -> RUNNING after the worker acknowledged the attempt
pub fn acknowledge(run: &mut PipelineRun, loc: JobLocation, attempt: u32) -> bool {
    let Some(job) = run.stages.get_mut(loc.stage).and_then(|s| s.jobs.get_mut(loc.job)) else {
        return false;
    };
    let meta = TransitionMeta {
        attempt: Some(attempt),
        ..Default::default()
    };
    apply_transition(job, JobStatus::Dispatching, JobStatus::Running, meta)
}

/// DISPATCHING -> PENDING after a failed dispatch; costs no retry budget
pub fn requeue(run: &mut PipelineRun, loc: JobLocation, attempt: u32) -> Effects {
    let mut fx = Effects::default();
    let Some(job) = run.stages.get_mut(loc.stage).and_then(|s| s.jobs.get_mut(loc.job)) else {
        return fx;
    };
    let meta = TransitionMeta {
        attempt: Some(attempt),
        ..Default::default()
    };
    if move_job(job, JobStatus::Dispatching, JobStatus::Pending, meta, &mut fx) {
        fx.wake = true;
    }
    fx
}

/// Outcome of applying a terminal report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Report for another attempt, or the job is no longer active
    Stale,
    Succeeded,
    /// Failure with budget left; the job is PENDING again
    Retried,
    Failed,
}

/// Applies a worker's terminal report to the job at `loc`
///
/// Execution failures (nonzero exit, timeout, lost worker) consume the
/// job's retry budget. Infrastructure failures are retried without touching
/// it, unconditionally unless a `max_infra_retries` ceiling is configured. A CANCELED report for a job the
/// control plane still considers active was not requested here and counts
/// as an infrastructure failure.
pub fn finish(
    run: &mut PipelineRun,
    loc: JobLocation,
    report: &TerminalReport,
    max_infra_retries: Option<u32>,
) -> (Finish, Effects) {
    let mut fx = Effects::default();
    let Some(job) = run.stages.get_mut(loc.stage).and_then(|s| s.jobs.get_mut(loc.job)) else {
        return (Finish::Stale, fx);
    };
    if !job.status.is_active() || job.attempt != report.attempt {
        return (Finish::Stale, fx);
    }

    let from = job.status;
    let meta = |reason: Option<JobReason>| TransitionMeta {
        attempt: Some(report.attempt),
        worker_id: None,
        exit_code: report.exit_code,
        reason,
    };

    let outcome = match report.status {
        JobStatus::Succeeded => {
            move_job(job, from, JobStatus::Succeeded, meta(None), &mut fx);
            Finish::Succeeded
        }
        _ => {
            let reason = match (&report.status, &report.reason) {
                (JobStatus::Canceled, _) => JobReason::Infrastructure {
                    message: "worker canceled the job unprompted".to_string(),
                },
                (_, Some(reason)) => reason.clone(),
                (_, None) => match report.exit_code {
                    Some(code) => JobReason::CommandFailed { exit_code: code },
                    None => JobReason::Infrastructure {
                        message: "worker reported failure without a reason".to_string(),
                    },
                },
            };
            fail_or_retry(job, from, meta(Some(reason)), max_infra_retries, &mut fx)
        }
    };

    settle(run, &mut fx);
    (outcome, fx)
}

/// Either returns the job to PENDING (budget left) or fails it
fn fail_or_retry(
    job: &mut JobRun,
    from: JobStatus,
    meta: TransitionMeta,
    max_infra_retries: Option<u32>,
    fx: &mut Effects,
) -> Finish {
    let consumes_budget = meta
        .reason
        .as_ref()
        .is_none_or(JobReason::consumes_retry_budget);

    let retry = if consumes_budget {
        job.can_retry()
    } else {
        max_infra_retries.is_none_or(|max| job.infra_retries < max)
    };

    if retry && move_job(job, from, JobStatus::Pending, meta.clone(), fx) {
        if consumes_budget {
            job.retry_count += 1;
        } else {
            job.infra_retries += 1;
        }
        return Finish::Retried;
    }

    move_job(job, from, JobStatus::Failed, meta, fx);
    Finish::Failed
}

/// Handles the loss of `worker_id`
///
/// RUNNING jobs count as execution failures (`WorkerLost`); DISPATCHING jobs
/// go back to PENDING at no cost.
pub fn worker_lost(run: &mut PipelineRun, worker_id: &str, max_infra_retries: Option<u32>) -> Effects {
    let mut fx = Effects::default();
    if run.status.is_terminal() {
        return fx;
    }

    let mut touched = false;
    for stage in run.stages.iter_mut() {
        for job in stage.jobs.iter_mut() {
            if job.worker_id.as_deref() != Some(worker_id) {
                continue;
            }
            let meta = TransitionMeta {
                attempt: Some(job.attempt),
                ..Default::default()
            };
            match job.status {
                JobStatus::Dispatching => {
                    touched |= move_job(job, JobStatus::Dispatching, JobStatus::Pending, meta, &mut fx);
                }
                JobStatus::Running => {
                    let meta = TransitionMeta {
                        reason: Some(JobReason::WorkerLost {
                            worker_id: worker_id.to_string(),
                        }),
                        ..meta
                    };
                    fail_or_retry(job, JobStatus::Running, meta, max_infra_retries, &mut fx);
                    touched = true;
                }
                _ => {}
            }
        }
    }

    if touched {
        settle(run, &mut fx);
    }
    fx
}

/// Fails RUNNING attempts on `worker_id` that its latest heartbeat no longer lists
///
/// Only attempts acknowledged before `acknowledged_before` are checked; any
/// later one may postdate the heartbeat. Such an attempt finished without its
/// report arriving and is treated like a lost worker. Returns the affected
/// job ids.
pub fn drop_unheld(
    run: &mut PipelineRun,
    worker_id: &str,
    held: &HashSet<HeldAttempt>,
    acknowledged_before: DateTime<Utc>,
    max_infra_retries: Option<u32>,
) -> (Vec<Uuid>, Effects) {
    let mut fx = Effects::default();
    let mut lost = Vec::new();
    if run.status.is_terminal() {
        return (lost, fx);
    }

    for stage in run.stages.iter_mut() {
        for job in stage.jobs.iter_mut() {
            if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
                continue;
            }
            if job.started_at.is_none_or(|at| at >= acknowledged_before) {
                continue;
            }
            let key = HeldAttempt {
                job_id: job.id,
                attempt: job.attempt,
            };
            if held.contains(&key) {
                continue;
            }

            let meta = TransitionMeta {
                attempt: Some(job.attempt),
                reason: Some(JobReason::WorkerLost {
                    worker_id: worker_id.to_string(),
                }),
                ..Default::default()
            };
            fail_or_retry(job, JobStatus::Running, meta, max_infra_retries, &mut fx);
            lost.push(job.id);
        }
    }

    if !lost.is_empty() {
        settle(run, &mut fx);
    }
    (lost, fx)
}

/// Cancels every non-terminal job and stage of a run
///
/// Active jobs get a best-effort cancel on their worker. A stage that
/// already settled (including the FAILED one that triggered a cascade)
/// keeps its status.
pub fn cascade(run: &mut PipelineRun, fx: &mut Effects, message: &str) {
    let now = Utc::now();
    let mut local = Effects::default();

    for stage in run.stages.iter_mut() {
        for job in stage.jobs.iter_mut() {
            if job.status.is_terminal() {
                continue;
            }
            let from = job.status;
            let active_on = job.worker_id.clone().filter(|_| from.is_active());
            let meta = TransitionMeta {
                reason: Some(JobReason::Canceled {
                    message: message.to_string(),
                }),
                ..Default::default()
            };
            if move_job(job, from, JobStatus::Canceled, meta, &mut local) {
                if let Some(worker_id) = active_on {
                    local.cancels.push(CancelRequest {
                        worker_id,
                        job_id: job.id,
                    });
                }
            }
        }

        if !stage.status.is_terminal() {
            stage.status = StageStatus::Canceled;
            stage.completed_at = Some(now);
        }
    }

    fx.merge(local);
}

/// Explicit cancellation requested by a submitter
///
/// Returns `None` when the run was already terminal.
pub fn cancel(run: &mut PipelineRun) -> Option<Effects> {
    if run.status.is_terminal() {
        return None;
    }

    let mut fx = Effects::default();
    cascade(run, &mut fx, "pipeline canceled");
    run.status = PipelineStatus::Canceled;
    run.completed_at = Some(Utc::now());
    fx.snapshot = Some(run.clone());
    Some(fx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExecutionStore;
    use crate::store::tests::{definition, job_def};
    use conveyor_core::model::validate;

    fn run_with(jobs: Vec<conveyor_core::domain::pipeline::JobDefinition>) -> PipelineRun {
        let store = ExecutionStore::new();
        let def = definition(vec![("build", jobs), ("test", vec![job_def("unit", &[])])]);
        let id = store.create_instances(&validate(&def).unwrap());
        let mut run = store.snapshot(id).unwrap();
        start(&mut run);
        run
    }

    fn at(run: &PipelineRun, stage: usize, job: usize) -> JobLocation {
        JobLocation {
            pipeline_id: run.id,
            stage,
            job,
        }
    }

    fn failed(run: &PipelineRun, loc: JobLocation, exit_code: i32) -> TerminalReport {
        let job = &run.stages[loc.stage].jobs[loc.job];
        TerminalReport {
            job_id: job.id,
            attempt: job.attempt,
            worker_id: "w1".to_string(),
            status: JobStatus::Failed,
            exit_code: Some(exit_code),
            reason: Some(JobReason::CommandFailed { exit_code }),
        }
    }

    #[test]
    fn test_start_runs_first_stage() {
        let run = run_with(vec![job_def("compile", &[])]);
        assert_eq!(run.status, PipelineStatus::Running);
        assert_eq!(run.stages[0].status, StageStatus::Running);
        assert_eq!(run.stages[1].status, StageStatus::Pending);
    }

    #[test]
    fn test_reserve_then_acknowledge() {
        let mut run = run_with(vec![job_def("compile", &[])]);
        let loc = at(&run, 0, 0);

        let spec = reserve(&mut run, loc, "w1").unwrap();
        assert_eq!(spec.attempt, 1);
        assert!(reserve(&mut run, loc, "w2").is_none());

        assert!(!acknowledge(&mut run, loc, 0));
        assert!(acknowledge(&mut run, loc, 1));
        assert_eq!(run.stages[0].jobs[0].status, JobStatus::Running);
    }

    #[test]
    fn test_requeue_releases_slot_without_budget() {
        let mut run = run_with(vec![job_def("compile", &[])]);
        let loc = at(&run, 0, 0);
        reserve(&mut run, loc, "w1").unwrap();

        let fx = requeue(&mut run, loc, 1);
        assert_eq!(fx.release, vec!["w1".to_string()]);
        assert!(fx.wake);

        let job = &run.stages[0].jobs[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.worker_id, None);
    }

    #[test]
    fn test_failure_with_budget_retries() {
        let mut compile = job_def("compile", &[]);
        compile.max_retries = 1;
        let mut run = run_with(vec![compile]);
        let loc = at(&run, 0, 0);
        reserve(&mut run, loc, "w1").unwrap();
        acknowledge(&mut run, loc, 1);

        let report = failed(&run, loc, 1);
        let (outcome, fx) = finish(&mut run, loc, &report, None);
        assert_eq!(outcome, Finish::Retried);
        assert_eq!(fx.release, vec!["w1".to_string()]);
        assert_eq!(run.stages[0].jobs[0].retry_count, 1);
        assert_eq!(run.status, PipelineStatus::Running);

        // The same report again is stale
        let (outcome, _) = finish(&mut run, loc, &report, None);
        assert_eq!(outcome, Finish::Stale);
    }

    #[test]
    fn test_infrastructure_failures_retry_without_ceiling() {
        let mut run = run_with(vec![job_def("compile", &[])]);
        let loc = at(&run, 0, 0);

        for attempt in 1..=8 {
            reserve(&mut run, loc, "w1").unwrap();
            let mut report = failed(&run, loc, 125);
            report.reason = Some(JobReason::Infrastructure {
                message: "image pull failed".to_string(),
            });
            assert_eq!(report.attempt, attempt);
            let (outcome, _) = finish(&mut run, loc, &report, None);
            assert_eq!(outcome, Finish::Retried);
        }

        let job = &run.stages[0].jobs[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!((job.retry_count, job.infra_retries), (0, 8));
        assert_eq!(run.status, PipelineStatus::Running);
    }

    #[test]
    fn test_infrastructure_ceiling_when_configured() {
        let mut run = run_with(vec![job_def("compile", &[])]);
        let loc = at(&run, 0, 0);
        reserve(&mut run, loc, "w1").unwrap();

        let mut report = failed(&run, loc, 125);
        report.reason = Some(JobReason::Infrastructure {
            message: "image pull failed".to_string(),
        });
        let (outcome, _) = finish(&mut run, loc, &report, Some(1));
        assert_eq!(outcome, Finish::Retried);
        let job = &run.stages[0].jobs[0];
        assert_eq!((job.retry_count, job.infra_retries), (0, 1));

        // Ceiling reached
        reserve(&mut run, loc, "w1").unwrap();
        report.attempt = 2;
        let (outcome, _) = finish(&mut run, loc, &report, Some(1));
        assert_eq!(outcome, Finish::Failed);
        assert_eq!(run.status, PipelineStatus::Failed);
    }

    #[test]
    fn test_failure_cascades() {
        let mut run = run_with(vec![job_def("compile", &[]), job_def("lint", &[])]);
        let compile = at(&run, 0, 0);
        let lint = at(&run, 0, 1);
        reserve(&mut run, compile, "w1").unwrap();
        reserve(&mut run, lint, "w2").unwrap();
        acknowledge(&mut run, lint, 1);

        let report = failed(&run, compile, 2);
        let (outcome, fx) = finish(&mut run, compile, &report, None);
        assert_eq!(outcome, Finish::Failed);

        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.stages[0].status, StageStatus::Failed);
        assert_eq!(run.stages[1].status, StageStatus::Canceled);
        assert_eq!(run.stages[0].jobs[1].status, JobStatus::Canceled);
        assert_eq!(run.stages[1].jobs[0].status, JobStatus::Canceled);
        assert_eq!(
            fx.cancels,
            vec![CancelRequest {
                worker_id: "w2".to_string(),
                job_id: run.stages[0].jobs[1].id,
            }]
        );
        let mut released = fx.release.clone();
        released.sort();
        assert_eq!(released, vec!["w1".to_string(), "w2".to_string()]);
        assert!(fx.snapshot.is_some());
    }

    #[test]
    fn test_unrequested_cancel_is_infrastructure() {
        let mut run = run_with(vec![job_def("compile", &[])]);
        let loc = at(&run, 0, 0);
        reserve(&mut run, loc, "w1").unwrap();
        acknowledge(&mut run, loc, 1);

        let report = TerminalReport {
            job_id: run.stages[0].jobs[0].id,
            attempt: 1,
            worker_id: "w1".to_string(),
            status: JobStatus::Canceled,
            exit_code: None,
            reason: None,
        };
        let (outcome, _) = finish(&mut run, loc, &report, None);
        assert_eq!(outcome, Finish::Retried);
        assert_eq!(run.stages[0].jobs[0].infra_retries, 1);
    }

    #[test]
    fn test_worker_lost() {
        let mut run = run_with(vec![job_def("compile", &[]), job_def("lint", &[])]);
        let compile = at(&run, 0, 0);
        let lint = at(&run, 0, 1);
        reserve(&mut run, compile, "w1").unwrap();
        acknowledge(&mut run, compile, 1);
        reserve(&mut run, lint, "w1").unwrap();

        let fx = worker_lost(&mut run, "w1", None);

        // Running job had no budget left; dispatching job is simply requeued
        assert_eq!(run.stages[0].jobs[0].status, JobStatus::Failed);
        assert_eq!(
            run.stages[0].jobs[0].reason,
            Some(JobReason::WorkerLost {
                worker_id: "w1".to_string()
            })
        );
        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.stages[0].jobs[1].status, JobStatus::Canceled);
        assert_eq!(fx.release.len(), 2);
    }

    #[test]
    fn test_explicit_cancel() {
        let mut run = run_with(vec![job_def("compile", &[])]);
        let loc = at(&run, 0, 0);
        reserve(&mut run, loc, "w1").unwrap();

        let fx = cancel(&mut run).unwrap();
        assert_eq!(run.status, PipelineStatus::Canceled);
        assert_eq!(run.stages[0].status, StageStatus::Canceled);
        assert_eq!(fx.cancels.len(), 1);
        assert!(cancel(&mut run).is_none());
    }

    #[test]
    fn test_drop_unheld_attempts() {
        let mut compile = job_def("compile", &[]);
        compile.max_retries = 1;
        let mut run = run_with(vec![compile, job_def("lint", &[])]);
        let compile = at(&run, 0, 0);
        let lint = at(&run, 0, 1);
        reserve(&mut run, compile, "w1").unwrap();
        acknowledge(&mut run, compile, 1);
        reserve(&mut run, lint, "w1").unwrap();
        acknowledge(&mut run, lint, 1);

        let lint_id = run.stages[0].jobs[1].id;
        let held: HashSet<HeldAttempt> = [HeldAttempt {
            job_id: lint_id,
            attempt: 1,
        }]
        .into();

        // Acknowledged after the cutoff: left alone
        let before = Utc::now() - chrono::Duration::seconds(5);
        let (lost, _) = drop_unheld(&mut run, "w1", &held, before, None);
        assert!(lost.is_empty());

        let after = Utc::now() + chrono::Duration::seconds(5);
        let (lost, fx) = drop_unheld(&mut run, "w1", &held, after, None);
        assert_eq!(lost, vec![run.stages[0].jobs[0].id]);
        assert_eq!(fx.release, vec!["w1".to_string()]);

        let job = &run.stages[0].jobs[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(
            job.reason,
            Some(JobReason::WorkerLost {
                worker_id: "w1".to_string()
            })
        );
        assert_eq!(run.stages[0].jobs[1].status, JobStatus::Running);

        // Another worker's heartbeat never touches these jobs
        let (lost, _) = drop_unheld(&mut run, "w2", &HashSet::new(), after, None);
        assert!(lost.is_empty());
    }
}
