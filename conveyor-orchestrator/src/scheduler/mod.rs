//! Scheduler
//!
//! Owns the execution store and the worker registry and drives every
//! pipeline forward:
//! - an event-driven loop woken by submissions, reports, heartbeats,
//!   dispatch failures and worker loss, backed by a periodic safety sweep
//! - a liveness loop that turns missed heartbeats into SUSPECT and DEAD
//!   workers
//!
//! State changes happen inside a pipeline's serialized section (see
//! [`machine`]); RPCs are issued only after the section is left. Dispatch
//! RPCs run detached from the loop, so a slow worker never holds up the
//! next scheduling pass.

pub mod machine;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_core::domain::pipeline::{PipelineDefinition, PipelineRun};
use conveyor_core::domain::worker::Worker;
use conveyor_core::dto::job::{DispatchAck, JobSpec, TerminalReport};
use conveyor_core::dto::pipeline::PipelineSummary;
use conveyor_core::dto::worker::{Heartbeat, HeldAttempt};
use conveyor_core::model::{ValidationErrors, validate};
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::{DispatchError, WorkerRpc};
use crate::registry::{WorkerRegistry, WorkerTarget};
use crate::store::{self, ExecutionStore, JobLocation};
use machine::{Effects, Finish};

/// Timing and retry settings used by the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub dispatch_timeout: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_infra_retries: Option<u32>,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            dispatch_timeout: config.dispatch_timeout,
            sweep_interval: config.sweep_interval,
            heartbeat_interval: config.heartbeat_interval,
            max_infra_retries: config.max_infra_retries,
        }
    }
}

/// A dispatch RPC to make; the worker slot is already reserved
struct Dispatch {
    loc: JobLocation,
    target: WorkerTarget,
    spec: JobSpec,
}

type DispatchOutcome = (Dispatch, Result<DispatchAck, DispatchError>);

pub struct Scheduler {
    store: ExecutionStore,
    registry: WorkerRegistry,
    rpc: Arc<dyn WorkerRpc>,
    config: SchedulerConfig,
    wake: Notify,
    history: Option<mpsc::UnboundedSender<PipelineRun>>,
}

impl Scheduler {
    pub fn new(config: &Config, rpc: Arc<dyn WorkerRpc>) -> Self {
        Self {
            store: ExecutionStore::new(),
            registry: WorkerRegistry::new(
                config.heartbeat_interval,
                config.suspect_after_missed,
                config.dead_after_missed,
            ),
            rpc,
            config: SchedulerConfig::from(config),
            wake: Notify::new(),
            history: None,
        }
    }

    /// Sends a snapshot of a run to `tx` whenever its pipeline status changes
    pub fn with_history(mut self, tx: mpsc::UnboundedSender<PipelineRun>) -> Self {
        self.history = Some(tx);
        self
    }

    // =============================================================================
    // Submission & queries
    // =============================================================================

    /// Validates a definition, creates its run and starts its first stage
    pub fn submit(&self, def: &PipelineDefinition) -> Result<Uuid, ValidationErrors> {
        let validated = validate(def)?;
        let id = self.store.create_instances(&validated);
        info!("Pipeline {} ({}) submitted with {} stage(s)", def.name, id, def.stages.len());

        let fx = self.store.with_pipeline(id, |run| {
            let mut fx = machine::start(run);
            self.publish(&mut fx);
            fx
        });
        if let Some(fx) = fx {
            self.apply(fx);
        }
        Ok(id)
    }

    pub fn snapshot(&self, pipeline_id: Uuid) -> Option<PipelineRun> {
        self.store.snapshot(pipeline_id)
    }

    pub fn summaries(&self) -> Vec<PipelineSummary> {
        self.store.summaries()
    }

    /// Runs of `name` still held in memory
    pub fn history(&self, name: &str) -> Vec<PipelineSummary> {
        self.store.history(name)
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.registry.list()
    }

    // =============================================================================
    // Events
    // =============================================================================

    /// Applies a worker's terminal report
    ///
    /// Returns `None` for an unknown job and `Some(false)` for a stale or
    /// duplicate report.
    pub fn report(&self, report: &TerminalReport) -> Option<bool> {
        let loc = self.store.locate(report.job_id)?;
        let max_infra = self.config.max_infra_retries;
        let (outcome, fx) = self.store.with_pipeline(loc.pipeline_id, |run| {
            let (outcome, mut fx) = machine::finish(run, loc, report, max_infra);
            self.publish(&mut fx);
            (outcome, fx)
        })?;

        match outcome {
            Finish::Stale => debug!(
                "Ignoring stale report for job {} (attempt {}) from {}",
                report.job_id, report.attempt, report.worker_id
            ),
            Finish::Succeeded => info!("Job {} succeeded on {}", report.job_id, report.worker_id),
            Finish::Retried => info!(
                "Job {} failed on {} (attempt {}), retrying",
                report.job_id, report.worker_id, report.attempt
            ),
            Finish::Failed => warn!(
                "Job {} failed on {} (attempt {}): {}",
                report.job_id,
                report.worker_id,
                report.attempt,
                report
                    .reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no reason given".to_string())
            ),
        }

        self.apply(fx);
        Some(outcome != Finish::Stale)
    }

    /// Cancels a run
    ///
    /// Returns `None` for an unknown pipeline and `Some(false)` when it had
    /// already finished.
    pub fn cancel_pipeline(&self, pipeline_id: Uuid) -> Option<bool> {
        let fx = self.store.with_pipeline(pipeline_id, |run| {
            let mut fx = machine::cancel(run)?;
            self.publish(&mut fx);
            Some(fx)
        })?;
        match fx {
            Some(fx) => {
                info!("Pipeline {} canceled", pipeline_id);
                self.apply(fx);
                Some(true)
            }
            None => Some(false),
        }
    }

    /// Records a heartbeat and reconciles the attempts it lists
    pub fn heartbeat(&self, hb: &Heartbeat) {
        let beat = self.registry.heartbeat(hb);
        debug!(
            "Heartbeat from {} (load {}/{}, holding {})",
            hb.worker_id,
            hb.current_load,
            hb.capacity,
            hb.held.len()
        );

        if let Some(previous_at) = beat.previous_at {
            self.drop_unheld(hb, previous_at);
        }
        self.count_untracked(hb);
        self.wake.notify_one();
    }

    /// Fails RUNNING attempts the worker no longer holds
    ///
    /// Beats are sent one at a time, so an attempt acknowledged before the
    /// previous beat arrived is listed by this one if the worker still has it.
    fn drop_unheld(&self, hb: &Heartbeat, acknowledged_before: DateTime<Utc>) {
        let held: HashSet<HeldAttempt> = hb.held.iter().copied().collect();
        let max_infra = self.config.max_infra_retries;

        for pipeline_id in self.store.active_pipelines() {
            let section = self.store.with_pipeline(pipeline_id, |run| {
                let (lost, mut fx) =
                    machine::drop_unheld(run, &hb.worker_id, &held, acknowledged_before, max_infra);
                self.publish(&mut fx);
                (lost, fx)
            });
            if let Some((lost, fx)) = section {
                for job_id in &lost {
                    warn!(
                        "Worker {} no longer holds job {} and its report never arrived",
                        hb.worker_id, job_id
                    );
                }
                self.apply(fx);
            }
        }
    }

    /// Counts attempts on the worker that belong to no active job here
    fn count_untracked(&self, hb: &Heartbeat) {
        let active: HashSet<HeldAttempt> = self
            .store
            .jobs_on_worker(&hb.worker_id)
            .into_iter()
            .map(|(job_id, _, attempt)| HeldAttempt { job_id, attempt })
            .collect();
        let untracked = hb.held.iter().filter(|h| !active.contains(h)).count();
        self.registry
            .set_untracked(&hb.worker_id, u32::try_from(untracked).unwrap_or(u32::MAX));
    }

    /// Runs the liveness sweep as of `now`; returns the workers found dead
    pub fn sweep_liveness(&self, now: DateTime<Utc>) -> Vec<String> {
        let dead = self.registry.sweep(now);
        for worker_id in &dead {
            self.worker_lost(worker_id);
        }
        dead
    }

    /// Fails or requeues every job held by a dead worker
    pub fn worker_lost(&self, worker_id: &str) {
        let max_infra = self.config.max_infra_retries;
        for pipeline_id in self.store.active_pipelines() {
            let fx = self.store.with_pipeline(pipeline_id, |run| {
                let mut fx = machine::worker_lost(run, worker_id, max_infra);
                self.publish(&mut fx);
                fx
            });
            if let Some(fx) = fx {
                self.apply(fx);
            }
        }
    }

    // =============================================================================
    // Dispatch
    // =============================================================================

    /// Reserves a slot for every runnable job, without any I/O
    fn plan(&self) -> Vec<Dispatch> {
        let mut batch = Vec::new();

        for pipeline_id in self.store.active_pipelines() {
            let fx = self.store.with_pipeline(pipeline_id, |run| {
                let mut fx = machine::advance(run);
                for (stage, job) in store::runnable(run) {
                    let Some(target) = self.registry.reserve() else {
                        debug!("No worker capacity left for pipeline {}", pipeline_id);
                        break;
                    };
                    let loc = JobLocation {
                        pipeline_id,
                        stage,
                        job,
                    };
                    match machine::reserve(run, loc, &target.id) {
                        Some(spec) => batch.push(Dispatch { loc, target, spec }),
                        None => self.registry.release(&target.id),
                    }
                }
                self.publish(&mut fx);
                fx
            });
            if let Some(fx) = fx {
                self.apply(fx);
            }
        }

        batch
    }

    /// Starts one dispatch RPC on `set`, bounded by the dispatch timeout
    fn spawn_dispatch(&self, set: &mut JoinSet<DispatchOutcome>, dispatch: Dispatch) {
        let rpc = self.rpc.clone();
        let timeout = self.config.dispatch_timeout;
        set.spawn(async move {
            let result = match tokio::time::timeout(timeout, rpc.dispatch(&dispatch.target, &dispatch.spec)).await
            {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout {
                    worker: dispatch.target.id.clone(),
                    after: timeout,
                }),
            };
            (dispatch, result)
        });
    }

    fn on_joined(&self, joined: Result<DispatchOutcome, JoinError>) {
        match joined {
            Ok((dispatch, result)) => self.on_dispatch(dispatch, result),
            Err(e) => error!("Dispatch task failed: {}", e),
        }
    }

    /// One scheduling pass that waits for every dispatch it started
    ///
    /// Returns the number of dispatch attempts made. The run loop performs
    /// the same steps without waiting.
    pub async fn schedule_all(&self) -> usize {
        let mut set = JoinSet::new();
        for dispatch in self.plan() {
            self.spawn_dispatch(&mut set, dispatch);
        }

        let attempts = set.len();
        while let Some(joined) = set.join_next().await {
            self.on_joined(joined);
        }
        attempts
    }

    fn on_dispatch(&self, dispatch: Dispatch, result: Result<DispatchAck, DispatchError>) {
        let Dispatch { loc, target, spec } = dispatch;
        match result {
            Ok(ack) => {
                if ack.already_running {
                    debug!("Worker {} already runs job {}", target.id, spec.job_id);
                }
                let acknowledged = self
                    .store
                    .with_pipeline(loc.pipeline_id, |run| machine::acknowledge(run, loc, spec.attempt))
                    .unwrap_or(false);
                if acknowledged {
                    info!(
                        "Job {} ({}) running on {} (attempt {})",
                        spec.name, spec.job_id, target.id, spec.attempt
                    );
                } else {
                    debug!("Dispatch ack for job {} arrived after it moved on", spec.job_id);
                }
            }
            Err(e) => {
                warn!("Dispatch of job {} failed: {}", spec.job_id, e);
                self.registry.mark_suspect(&target.id);
                let fx = self.store.with_pipeline(loc.pipeline_id, |run| {
                    let mut fx = machine::requeue(run, loc, spec.attempt);
                    self.publish(&mut fx);
                    fx
                });
                if let Some(fx) = fx {
                    self.apply(fx);
                }
            }
        }
    }

    /// Hands a status snapshot to the history writer
    ///
    /// Called inside the serialized section, so snapshots of one run are
    /// enqueued in the order they were taken.
    fn publish(&self, fx: &mut Effects) {
        let Some(run) = fx.snapshot.take() else {
            return;
        };
        info!("Pipeline {} ({}) is now {}", run.name, run.id, run.status);
        if let Some(tx) = &self.history {
            if tx.send(run).is_err() {
                warn!("Run history writer has stopped");
            }
        }
    }

    /// Applies effects collected inside a serialized section
    fn apply(&self, fx: Effects) {
        for worker_id in &fx.release {
            self.registry.release(worker_id);
        }

        for cancel in fx.cancels {
            let Some(target) = self.registry.target(&cancel.worker_id) else {
                continue;
            };
            let rpc = self.rpc.clone();
            let timeout = self.config.dispatch_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, rpc.cancel(&target, cancel.job_id)).await {
                    Ok(Ok(())) => debug!("Cancel for job {} sent to {}", cancel.job_id, target.id),
                    Ok(Err(e)) => warn!("Cancel for job {} failed: {}", cancel.job_id, e),
                    Err(_) => warn!("Cancel for job {} to {} timed out", cancel.job_id, target.id),
                }
            });
        }

        if fx.wake {
            self.wake.notify_one();
        }
    }

    // =============================================================================
    // Loops
    // =============================================================================

    /// Scheduling loop; runs until the task is dropped
    ///
    /// Dispatch RPCs stay in flight across passes; their results are folded
    /// back in as they complete.
    pub async fn run(self: Arc<Self>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let mut inflight = JoinSet::new();
        info!("Scheduler started (sweep every {:?})", self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = sweep.tick() => {}
                Some(joined) = inflight.join_next() => {
                    self.on_joined(joined);
                    continue;
                }
            }
            for dispatch in self.plan() {
                self.spawn_dispatch(&mut inflight, dispatch);
            }
        }
    }

    /// Heartbeat liveness loop
    pub async fn run_liveness(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            ticker.tick().await;
            let dead = self.sweep_liveness(Utc::now());
            if !dead.is_empty() {
                warn!("Workers lost: {}", dead.join(", "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{definition, job_def};
    use async_trait::async_trait;
    use conveyor_core::domain::job::JobReason;
    use conveyor_core::domain::status::{JobStatus, PipelineStatus, StageStatus};
    use conveyor_core::domain::worker::WorkerHealth;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRpc {
        hang: Mutex<HashSet<String>>,
        dispatched: Mutex<Vec<(String, JobSpec)>>,
        canceled: Mutex<Vec<(String, Uuid)>>,
    }

    impl FakeRpc {
        fn dispatched_names(&self) -> Vec<String> {
            self.dispatched
                .lock()
                .unwrap()
                .iter()
                .map(|(_, spec)| spec.name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl WorkerRpc for FakeRpc {
        async fn dispatch(&self, target: &WorkerTarget, spec: &JobSpec) -> Result<DispatchAck, DispatchError> {
            let hang = self.hang.lock().unwrap().contains(&target.id);
            if hang {
                std::future::pending::<()>().await;
            }
            self.dispatched
                .lock()
                .unwrap()
                .push((target.id.clone(), spec.clone()));
            Ok(DispatchAck {
                job_id: spec.job_id,
                attempt: spec.attempt,
                already_running: false,
            })
        }

        async fn cancel(&self, target: &WorkerTarget, job_id: Uuid) -> Result<(), DispatchError> {
            self.canceled.lock().unwrap().push((target.id.clone(), job_id));
            Ok(())
        }
    }

    fn scheduler(rpc: Arc<FakeRpc>) -> Scheduler {
        let mut config = Config::default();
        config.dispatch_timeout = Duration::from_millis(50);
        Scheduler::new(&config, rpc)
    }

    fn beat(id: &str, capacity: u32, held: Vec<HeldAttempt>) -> Heartbeat {
        Heartbeat {
            worker_id: id.to_string(),
            address: format!("http://{}:9090", id),
            capacity,
            current_load: held.len() as u32,
            held,
        }
    }

    fn worker(s: &Scheduler, id: &str, capacity: u32) {
        s.heartbeat(&beat(id, capacity, Vec::new()));
    }

    fn held(s: &Scheduler, pipeline: Uuid, stage: usize, job: usize) -> HeldAttempt {
        let job = &s.snapshot(pipeline).unwrap().stages[stage].jobs[job];
        HeldAttempt {
            job_id: job.id,
            attempt: job.attempt,
        }
    }

    fn report(s: &Scheduler, pipeline: Uuid, stage: usize, job: usize, status: JobStatus) -> TerminalReport {
        let job = s.snapshot(pipeline).unwrap().stages[stage].jobs[job].clone();
        let exit_code = match status {
            JobStatus::Succeeded => Some(0),
            _ => Some(1),
        };
        TerminalReport {
            job_id: job.id,
            attempt: job.attempt,
            worker_id: job.worker_id.unwrap_or_default(),
            status,
            exit_code,
            reason: (status == JobStatus::Failed).then_some(JobReason::CommandFailed { exit_code: 1 }),
        }
    }

    async fn wait_for_cancels(rpc: &FakeRpc, count: usize) {
        for _ in 0..100 {
            if rpc.canceled.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let s = scheduler(Arc::new(FakeRpc::default()));
        let errors = s.submit(&definition(vec![])).unwrap_err();
        assert!(!errors.0.is_empty());
        assert!(s.summaries().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_respects_capacity() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 2);

        let jobs = (0..5).map(|i| job_def(&format!("job{}", i), &[])).collect();
        let id = s.submit(&definition(vec![("build", jobs)])).unwrap();

        assert_eq!(s.schedule_all().await, 2);
        assert_eq!(s.workers()[0].load, 2);

        let run = s.snapshot(id).unwrap();
        let running = run.stages[0]
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count();
        assert_eq!(running, 2);

        // No slot left: nothing more goes out
        assert_eq!(s.schedule_all().await, 0);
    }

    #[tokio::test]
    async fn test_dependencies_wait_for_success() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 4);

        let id = s
            .submit(&definition(vec![(
                "build",
                vec![job_def("compile", &[]), job_def("package", &["compile"])],
            )]))
            .unwrap();

        s.schedule_all().await;
        assert_eq!(rpc.dispatched_names(), vec!["compile"]);

        s.report(&report(&s, id, 0, 0, JobStatus::Succeeded));
        s.schedule_all().await;
        assert_eq!(rpc.dispatched_names(), vec!["compile", "package"]);
    }

    #[tokio::test]
    async fn test_retries_then_success() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 1);

        let mut flaky = job_def("flaky", &[]);
        flaky.max_retries = 2;
        let id = s
            .submit(&definition(vec![("build", vec![flaky]), ("deploy", vec![job_def("ship", &[])])]))
            .unwrap();

        for _ in 0..2 {
            s.schedule_all().await;
            assert_eq!(s.report(&report(&s, id, 0, 0, JobStatus::Failed)), Some(true));
        }
        let job = &s.snapshot(id).unwrap().stages[0].jobs[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 2);

        s.schedule_all().await;
        assert_eq!(s.report(&report(&s, id, 0, 0, JobStatus::Succeeded)), Some(true));

        let run = s.snapshot(id).unwrap();
        assert_eq!(run.stages[0].status, StageStatus::Succeeded);
        assert_eq!(run.stages[1].status, StageStatus::Running);

        s.schedule_all().await;
        assert_eq!(rpc.dispatched_names(), vec!["flaky", "flaky", "flaky", "ship"]);

        s.report(&report(&s, id, 1, 0, JobStatus::Succeeded));
        assert_eq!(s.snapshot(id).unwrap().status, PipelineStatus::Succeeded);
        assert_eq!(s.workers()[0].load, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_cascades() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 2);

        let id = s
            .submit(&definition(vec![
                ("build", vec![job_def("compile", &[]), job_def("lint", &[])]),
                ("test", vec![job_def("unit", &[])]),
            ]))
            .unwrap();
        s.schedule_all().await;

        let failure = report(&s, id, 0, 0, JobStatus::Failed);
        assert_eq!(s.report(&failure), Some(true));
        // Duplicate delivery is a no-op
        assert_eq!(s.report(&failure), Some(false));

        let run = s.snapshot(id).unwrap();
        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.stages[0].status, StageStatus::Failed);
        assert_eq!(run.stages[0].jobs[0].status, JobStatus::Failed);
        assert_eq!(run.stages[0].jobs[1].status, JobStatus::Canceled);
        assert_eq!(run.stages[1].status, StageStatus::Canceled);
        assert_eq!(run.stages[1].started_at, None);

        wait_for_cancels(&rpc, 1).await;
        let lint = run.stages[0].jobs[1].id;
        assert_eq!(*rpc.canceled.lock().unwrap(), vec![("w1".to_string(), lint)]);

        assert_eq!(s.schedule_all().await, 0);
        assert!(!rpc.dispatched_names().contains(&"unit".to_string()));
        assert_eq!(s.workers()[0].load, 0);
    }

    #[tokio::test]
    async fn test_allowed_failure_proceeds() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 2);

        let mut lint = job_def("lint", &[]);
        lint.allow_failure = true;
        let id = s
            .submit(&definition(vec![
                ("build", vec![job_def("compile", &[]), lint]),
                ("test", vec![job_def("unit", &[])]),
            ]))
            .unwrap();
        s.schedule_all().await;

        s.report(&report(&s, id, 0, 1, JobStatus::Failed));
        assert_eq!(s.snapshot(id).unwrap().stages[0].status, StageStatus::Running);

        s.report(&report(&s, id, 0, 0, JobStatus::Succeeded));
        let run = s.snapshot(id).unwrap();
        assert_eq!(run.stages[0].status, StageStatus::Succeeded);
        assert_eq!(run.stages[0].jobs[1].status, JobStatus::Failed);
        assert_eq!(run.status, PipelineStatus::Running);

        s.schedule_all().await;
        assert!(rpc.dispatched_names().contains(&"unit".to_string()));
    }

    #[tokio::test]
    async fn test_worker_dead_mid_run() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 1);

        let mut compile = job_def("compile", &[]);
        compile.max_retries = 1;
        let id = s.submit(&definition(vec![("build", vec![compile])])).unwrap();
        s.schedule_all().await;
        let late = report(&s, id, 0, 0, JobStatus::Succeeded);

        // w1 goes silent; budget remains so the job is retried
        let dead = s.sweep_liveness(Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(dead, vec!["w1".to_string()]);
        let job = s.snapshot(id).unwrap().stages[0].jobs[0].clone();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.reason, Some(JobReason::WorkerLost { worker_id: "w1".to_string() }));

        // A report from the lost attempt is stale
        assert_eq!(s.report(&late), Some(false));

        worker(&s, "w2", 1);
        s.schedule_all().await;
        let job = s.snapshot(id).unwrap().stages[0].jobs[0].clone();
        assert_eq!(job.worker_id.as_deref(), Some("w2"));
        assert_eq!(job.attempt, 2);

        // w2 dies too; budget exhausted
        s.sweep_liveness(Utc::now() + chrono::Duration::seconds(60));
        let run = s.snapshot(id).unwrap();
        assert_eq!(run.stages[0].jobs[0].status, JobStatus::Failed);
        assert_eq!(run.status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_dispatch_timeout_requeues() {
        let rpc = Arc::new(FakeRpc::default());
        rpc.hang.lock().unwrap().insert("w1".to_string());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 1);
        worker(&s, "w2", 1);

        let id = s.submit(&definition(vec![("build", vec![job_def("compile", &[])])])).unwrap();

        // Equal free capacity and load: w1 wins on id, then times out
        assert_eq!(s.schedule_all().await, 1);
        let job = s.snapshot(id).unwrap().stages[0].jobs[0].clone();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);

        let workers = s.workers();
        assert_eq!(workers[0].health, WorkerHealth::Suspect);
        assert_eq!(workers[0].load, 0);

        s.schedule_all().await;
        let job = s.snapshot(id).unwrap().stages[0].jobs[0].clone();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.worker_id.as_deref(), Some("w2"));
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_pipeline() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 1);

        let id = s.submit(&definition(vec![("build", vec![job_def("compile", &[])])])).unwrap();
        s.schedule_all().await;

        assert_eq!(s.cancel_pipeline(id), Some(true));
        assert_eq!(s.cancel_pipeline(id), Some(false));
        assert_eq!(s.cancel_pipeline(Uuid::new_v4()), None);

        wait_for_cancels(&rpc, 1).await;
        assert_eq!(rpc.canceled.lock().unwrap().len(), 1);
        assert_eq!(s.snapshot(id).unwrap().status, PipelineStatus::Canceled);
        assert_eq!(s.workers()[0].load, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_report() {
        let s = scheduler(Arc::new(FakeRpc::default()));
        let report = TerminalReport {
            job_id: Uuid::new_v4(),
            attempt: 1,
            worker_id: "w1".to_string(),
            status: JobStatus::Succeeded,
            exit_code: Some(0),
            reason: None,
        };
        assert_eq!(s.report(&report), None);
    }

    #[tokio::test]
    async fn test_history_receives_status_changes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = scheduler(Arc::new(FakeRpc::default())).with_history(tx);

        let id = s.submit(&definition(vec![("build", vec![job_def("compile", &[])])])).unwrap();
        let run = rx.recv().await.unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.status, PipelineStatus::Running);
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_on_wake() {
        let rpc = Arc::new(FakeRpc::default());
        let s = Arc::new(scheduler(rpc.clone()));
        worker(&s, "w1", 1);
        let handle = tokio::spawn(s.clone().run());

        s.submit(&definition(vec![("build", vec![job_def("compile", &[])])])).unwrap();
        for _ in 0..100 {
            if !rpc.dispatched_names().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert_eq!(rpc.dispatched_names(), vec!["compile"]);
    }

    #[tokio::test]
    async fn test_infrastructure_failures_keep_requeueing() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 1);

        let id = s.submit(&definition(vec![("build", vec![job_def("compile", &[])])])).unwrap();
        for _ in 0..6 {
            s.schedule_all().await;
            let mut failure = report(&s, id, 0, 0, JobStatus::Failed);
            failure.reason = Some(JobReason::Infrastructure {
                message: "image pull failed".to_string(),
            });
            assert_eq!(s.report(&failure), Some(true));
        }

        let run = s.snapshot(id).unwrap();
        let job = &run.stages[0].jobs[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!((job.retry_count, job.infra_retries), (0, 6));
        assert_eq!(run.status, PipelineStatus::Running);
        assert_eq!(s.schedule_all().await, 1);
    }

    #[tokio::test]
    async fn test_lost_report_detected_from_heartbeats() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 1);

        let mut compile = job_def("compile", &[]);
        compile.max_retries = 1;
        let id = s.submit(&definition(vec![("build", vec![compile])])).unwrap();
        s.schedule_all().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Built before the dispatch was acknowledged: proves nothing yet
        s.heartbeat(&beat("w1", 1, Vec::new()));
        assert_eq!(s.snapshot(id).unwrap().stages[0].jobs[0].status, JobStatus::Running);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Still held: nothing to do
        s.heartbeat(&beat("w1", 1, vec![held(&s, id, 0, 0)]));
        assert_eq!(s.snapshot(id).unwrap().stages[0].jobs[0].status, JobStatus::Running);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The worker let go of the attempt but its report never arrived
        s.heartbeat(&beat("w1", 1, Vec::new()));
        let job = s.snapshot(id).unwrap().stages[0].jobs[0].clone();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.reason, Some(JobReason::WorkerLost { worker_id: "w1".to_string() }));
        assert_eq!(s.workers()[0].load, 0);

        s.schedule_all().await;
        assert_eq!(s.snapshot(id).unwrap().stages[0].jobs[0].attempt, 2);
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.heartbeat(&beat("w1", 1, Vec::new()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.heartbeat(&beat("w1", 1, Vec::new()));
        assert_eq!(s.snapshot(id).unwrap().status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_revived_worker_leftovers_block_its_slots() {
        let rpc = Arc::new(FakeRpc::default());
        let s = scheduler(rpc.clone());
        worker(&s, "w1", 1);

        let mut compile = job_def("compile", &[]);
        compile.max_retries = 1;
        let id = s.submit(&definition(vec![("build", vec![compile])])).unwrap();
        s.schedule_all().await;
        let leftover = held(&s, id, 0, 0);

        s.sweep_liveness(Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(s.snapshot(id).unwrap().stages[0].jobs[0].status, JobStatus::Pending);

        // Back, still running the attempt it had before being declared dead
        s.heartbeat(&beat("w1", 1, vec![leftover]));
        assert_eq!(s.workers()[0].health, WorkerHealth::Healthy);
        assert_eq!(s.schedule_all().await, 0);

        // The leftover finished
        s.heartbeat(&beat("w1", 1, Vec::new()));
        assert_eq!(s.schedule_all().await, 1);
        assert_eq!(s.snapshot(id).unwrap().stages[0].jobs[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_slow_worker_does_not_stall_run_loop() {
        let rpc = Arc::new(FakeRpc::default());
        rpc.hang.lock().unwrap().insert("w1".to_string());
        let mut config = Config::default();
        config.dispatch_timeout = Duration::from_secs(30);
        let s = Arc::new(Scheduler::new(&config, rpc.clone()));
        worker(&s, "w1", 1);
        worker(&s, "w2", 1);
        let handle = tokio::spawn(s.clone().run());

        // Goes to w1, which never answers
        s.submit(&definition(vec![("build", vec![job_def("first", &[])])])).unwrap();
        for _ in 0..100 {
            if s.workers()[0].load == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        s.submit(&definition(vec![("build", vec![job_def("second", &[])])])).unwrap();
        for _ in 0..100 {
            if !rpc.dispatched_names().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert_eq!(rpc.dispatched_names(), vec!["second"]);
        assert_eq!(rpc.dispatched.lock().unwrap()[0].0, "w2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_history_ends_with_terminal_snapshot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(FakeRpc::default());
        let s = Arc::new(scheduler(rpc.clone()).with_history(tx));
        worker(&s, "w1", 64);

        let mut ids = Vec::new();
        for _ in 0..32 {
            let id = s.submit(&definition(vec![("build", vec![job_def("compile", &[])])])).unwrap();
            ids.push(id);
        }
        s.schedule_all().await;

        let mut tasks = JoinSet::new();
        for &id in &ids {
            let failure = report(&s, id, 0, 0, JobStatus::Failed);
            let reporter = s.clone();
            tasks.spawn(async move {
                reporter.report(&failure);
            });
            let canceler = s.clone();
            tasks.spawn(async move {
                canceler.cancel_pipeline(id);
            });
        }
        while tasks.join_next().await.is_some() {}
        drop(s);

        let mut last: std::collections::HashMap<Uuid, PipelineStatus> = std::collections::HashMap::new();
        while let Some(run) = rx.recv().await {
            if let Some(previous) = last.get(&run.id) {
                assert!(!previous.is_terminal(), "run {} changed after finishing", run.id);
            }
            last.insert(run.id, run.status);
        }
        assert_eq!(last.len(), ids.len());
        assert!(last.values().all(|status| status.is_terminal()));
    }
}
