//! Leader-side scheduling loop
//!
//! One scheduler task runs on every master but acts only while its
//! replicated log says it is the leader. It is the single submitter of
//! commands: RPC handlers hand requests over a bounded channel and wait on
//! oneshot replies, which serializes all log submissions through one place
//! and keeps responses ordered after the commands they depend on.

pub mod recovery;

use crate::config::Config;
use crate::consensus::ReplicatedLog;
use crate::error::CoordinatorError;
use crate::rpc::protocol::{
    ReportTaskRequest, RequestTaskResponse, SubmitJobResponse, TaskAssignment, TaskOutcome,
};
use crate::state::{
    Command, JobId, JobPhase, MachineState, TaskId, TaskKind, TaskState, WorkerId,
};
use crate::storage::StorageLayout;
use self::recovery::{classify_map_failure, classify_reduce_failure, RecoveryAction};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Leader-clock milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Requests dispatched into the scheduler loop.
pub enum SchedulerMsg {
    SubmitJob {
        input_files: Vec<PathBuf>,
        reduce_hint: Option<u32>,
        reply: oneshot::Sender<Result<SubmitJobResponse, CoordinatorError>>,
    },
    RequestTask {
        worker_id: WorkerId,
        addr: String,
        reply: oneshot::Sender<Result<RequestTaskResponse, CoordinatorError>>,
    },
    ReportTask {
        report: ReportTaskRequest,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Heartbeat {
        worker_id: WorkerId,
        addr: String,
    },
}

/// Cheap cloneable handle RPC handlers use to reach the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMsg>,
}

impl SchedulerHandle {
    pub async fn submit_job(
        &self,
        input_files: Vec<PathBuf>,
        reduce_hint: Option<u32>,
    ) -> Result<SubmitJobResponse, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMsg::SubmitJob {
                input_files,
                reduce_hint,
                reply,
            })
            .await
            .map_err(|_| CoordinatorError::SchedulerUnavailable)?;
        rx.await.map_err(|_| CoordinatorError::SchedulerUnavailable)?
    }

    pub async fn request_task(
        &self,
        worker_id: WorkerId,
        addr: String,
    ) -> Result<RequestTaskResponse, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMsg::RequestTask {
                worker_id,
                addr,
                reply,
            })
            .await
            .map_err(|_| CoordinatorError::SchedulerUnavailable)?;
        rx.await.map_err(|_| CoordinatorError::SchedulerUnavailable)?
    }

    pub async fn report_task(&self, report: ReportTaskRequest) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMsg::ReportTask { report, reply })
            .await
            .map_err(|_| CoordinatorError::SchedulerUnavailable)?;
        rx.await.map_err(|_| CoordinatorError::SchedulerUnavailable)?
    }

    /// Record a heartbeat arrival; fire-and-forget.
    pub async fn heartbeat(&self, worker_id: WorkerId, addr: String) -> Result<(), CoordinatorError> {
        self.tx
            .send(SchedulerMsg::Heartbeat { worker_id, addr })
            .await
            .map_err(|_| CoordinatorError::SchedulerUnavailable)
    }
}

/// The per-master scheduler loop.
pub struct Scheduler {
    config: Arc<Config>,
    log: Arc<dyn ReplicatedLog>,
    state: Arc<RwLock<MachineState>>,
    layout: StorageLayout,
    rx: mpsc::Receiver<SchedulerMsg>,
    /// Heartbeat arrival times observed by this node while leading.
    observed: HashMap<WorkerId, u64>,
    was_leader: bool,
}

/// Create a scheduler and the handle its RPC surface talks through.
pub fn channel(
    config: Arc<Config>,
    log: Arc<dyn ReplicatedLog>,
    state: Arc<RwLock<MachineState>>,
    layout: StorageLayout,
) -> (SchedulerHandle, Scheduler) {
    let (tx, rx) = mpsc::channel(config.scheduler_queue_depth);
    let scheduler = Scheduler {
        config,
        log,
        state,
        layout,
        rx,
        observed: HashMap::new(),
        was_leader: false,
    };
    (SchedulerHandle { tx }, scheduler)
}

impl Scheduler {
    /// Drive the loop until every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.log.is_leader() {
                        self.on_tick().await;
                    } else {
                        self.was_leader = false;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }
            }
        }
        info!("Scheduler loop stopped");
    }

    async fn handle_message(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::SubmitJob {
                input_files,
                reduce_hint,
                reply,
            } => {
                let result = self.handle_submit_job(input_files, reduce_hint).await;
                let _ = reply.send(result);
            }
            SchedulerMsg::RequestTask {
                worker_id,
                addr,
                reply,
            } => {
                let result = self.handle_request_task(worker_id, addr).await;
                let _ = reply.send(result);
            }
            SchedulerMsg::ReportTask { report, reply } => {
                let result = self.handle_report_task(report).await;
                let _ = reply.send(result);
            }
            SchedulerMsg::Heartbeat { worker_id, addr } => {
                self.handle_heartbeat(worker_id, addr).await;
            }
        }
    }

    fn not_leader(&self) -> CoordinatorError {
        CoordinatorError::NotLeader {
            hint: self.log.leader_hint(),
        }
    }

    async fn submit(&self, command: Command) -> Result<u64, CoordinatorError> {
        self.log.submit(command).await.map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Job submission
    // ------------------------------------------------------------------

    async fn handle_submit_job(
        &mut self,
        input_files: Vec<PathBuf>,
        reduce_hint: Option<u32>,
    ) -> Result<SubmitJobResponse, CoordinatorError> {
        if !self.log.is_leader() {
            return Err(self.not_leader());
        }
        if input_files.is_empty() {
            return Err(CoordinatorError::InvalidConfiguration {
                reason: "a job needs at least one input file".to_string(),
            });
        }

        let (active_job, active_workers) = {
            let state = self.state.read().await;
            (
                state.active_job().map(|j| j.id.clone()),
                state.active_worker_count(),
            )
        };
        if let Some(job_id) = active_job {
            return Err(CoordinatorError::JobAlreadyActive {
                job_id: job_id.to_string(),
            });
        }

        // Reducer count is fixed here for the life of the job: the hint if
        // given, otherwise the current worker pool size, otherwise the
        // configured fallback.
        let reduce_count = reduce_hint
            .filter(|r| *r > 0)
            .unwrap_or_else(|| {
                if active_workers > 0 {
                    active_workers
                } else {
                    self.config.worker_count_hint
                }
            })
            .max(1);

        let job_id = JobId::new();
        let map_count = input_files.len();
        self.submit(Command::SubmitJob {
            job_id: job_id.clone(),
            input_files,
            reduce_count,
            max_task_attempts: self.config.max_task_attempts,
            submitted_at_ms: now_ms(),
        })
        .await?;

        info!(
            "Accepted job {} with {} map tasks and {} reduce tasks",
            job_id, map_count, reduce_count
        );
        Ok(SubmitJobResponse {
            job_id: job_id.to_string(),
            reduce_count,
        })
    }

    // ------------------------------------------------------------------
    // Task assignment
    // ------------------------------------------------------------------

    async fn handle_request_task(
        &mut self,
        worker_id: WorkerId,
        addr: String,
    ) -> Result<RequestTaskResponse, CoordinatorError> {
        if !self.log.is_leader() {
            return Err(self.not_leader());
        }
        self.note_heartbeat(worker_id.clone());
        self.register_if_unknown(&worker_id, &addr).await?;

        // A worker only polls while idle; if the committed state still has
        // an assignment for it, that attempt was abandoned.
        let abandoned = {
            let state = self.state.read().await;
            state.assignment_of(&worker_id).map(|(task_id, _)| task_id)
        };
        if let Some(task_id) = abandoned {
            debug!("Worker {} abandoned {}; recovering", worker_id, task_id);
            self.recover_task(task_id).await;
            return Ok(self.no_task_response());
        }

        struct Picked {
            job_id: JobId,
            task_id: TaskId,
            attempt: u32,
            input_path: Option<PathBuf>,
            checkpoint: Option<PathBuf>,
            map_count: u32,
            reduce_count: u32,
        }

        let picked = {
            let state = self.state.read().await;
            state.active_job().and_then(|job| {
                let kind = match job.phase {
                    JobPhase::Map => TaskKind::Map,
                    JobPhase::Reduce => TaskKind::Reduce,
                    JobPhase::Done | JobPhase::Failed => return None,
                };
                state.next_idle_task(kind).map(|task| Picked {
                    job_id: job.id.clone(),
                    task_id: task.id,
                    attempt: task.attempt + 1,
                    input_path: task.input_path().cloned(),
                    checkpoint: task.checkpoint.clone(),
                    map_count: job.map_count(),
                    reduce_count: job.reduce_count,
                })
            })
        };

        let Some(picked) = picked else {
            return Ok(self.no_task_response());
        };

        self.submit(Command::AssignTask {
            job_id: picked.job_id.clone(),
            task: picked.task_id,
            worker: worker_id.clone(),
            attempt: picked.attempt,
            assigned_at_ms: now_ms(),
        })
        .await?;

        // The command may have been ignored (e.g. the worker was declared
        // dead in the same tick); only hand out what actually committed.
        let confirmed = {
            let state = self.state.read().await;
            state
                .task(picked.task_id)
                .map(|t| {
                    t.state == TaskState::InProgress
                        && t.attempt == picked.attempt
                        && t.assigned_worker.as_ref() == Some(&worker_id)
                })
                .unwrap_or(false)
        };
        if !confirmed {
            return Ok(self.no_task_response());
        }

        debug!(
            "Assigned {} attempt {} to {}",
            picked.task_id, picked.attempt, worker_id
        );
        Ok(RequestTaskResponse {
            task: Some(TaskAssignment {
                job_id: picked.job_id.to_string(),
                kind: picked.task_id.kind,
                index: picked.task_id.index,
                attempt: picked.attempt,
                input_path: picked.input_path,
                map_count: picked.map_count,
                reduce_count: picked.reduce_count,
                checkpoint_path: picked.checkpoint,
            }),
            retry_after_ms: 0,
        })
    }

    fn no_task_response(&self) -> RequestTaskResponse {
        RequestTaskResponse {
            task: None,
            retry_after_ms: self.config.poll_backoff.as_millis() as u64,
        }
    }

    // ------------------------------------------------------------------
    // Completion reports
    // ------------------------------------------------------------------

    async fn handle_report_task(
        &mut self,
        report: ReportTaskRequest,
    ) -> Result<(), CoordinatorError> {
        if !self.log.is_leader() {
            return Err(self.not_leader());
        }
        let task_id = TaskId {
            kind: report.kind,
            index: report.index,
        };
        let worker_id = WorkerId::from_string(report.worker_id.clone());

        let current = {
            let state = self.state.read().await;
            let job = state.active_job();
            let job_matches = job.is_some_and(|j| j.id.as_str() == report.job_id);
            let assignment_matches = state.task(task_id).is_some_and(|t| {
                t.state == TaskState::InProgress
                    && t.attempt == report.attempt
                    && t.assigned_worker.as_ref() == Some(&worker_id)
            });
            (job_matches && assignment_matches)
                .then(|| job.map(|j| (j.id.clone(), j.reduce_count)))
                .flatten()
        };
        let Some((job_id, reduce_count)) = current else {
            debug!(
                "Ignoring stale report for {} from {} at attempt {}",
                task_id, worker_id, report.attempt
            );
            return Ok(());
        };

        match report.outcome {
            TaskOutcome::Success => {
                if task_id.kind == TaskKind::Map && self.config.verify_map_output {
                    match self.layout.map_evidence(task_id.index, reduce_count).await {
                        Ok(evidence) if !evidence.all_durable() => {
                            warn!(
                                "Map {} reported done but partitions are missing or empty; rerunning",
                                task_id.index
                            );
                            self.submit(Command::ResetTask {
                                job_id,
                                task: task_id,
                                attempt: report.attempt,
                            })
                            .await?;
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Cannot verify map output for {}: {}", task_id, e);
                            self.fail_job(job_id, task_id, &worker_id, report.attempt, &e)
                                .await;
                            return Ok(());
                        }
                    }
                }
                self.submit(Command::CompleteTask {
                    job_id,
                    task: task_id,
                    worker: worker_id,
                    attempt: report.attempt,
                })
                .await?;
            }
            TaskOutcome::Failure => {
                let reason = report
                    .error
                    .unwrap_or_else(|| "task execution failed".to_string());
                warn!(
                    "Task {} failed on {} at attempt {}: {}",
                    task_id, worker_id, report.attempt, reason
                );
                self.submit(Command::FailTask {
                    job_id: job_id.clone(),
                    task: task_id,
                    worker: worker_id,
                    attempt: report.attempt,
                    reason,
                    fatal: false,
                })
                .await?;
                self.recover_task(task_id).await;
                if task_id.kind == TaskKind::Reduce {
                    // A reducer that cannot make progress may be starving on
                    // corrupted map output; check the inputs it depends on.
                    self.sweep_map_corruption().await;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Heartbeats and ticks
    // ------------------------------------------------------------------

    async fn handle_heartbeat(&mut self, worker_id: WorkerId, addr: String) {
        if !self.log.is_leader() {
            return;
        }
        self.note_heartbeat(worker_id.clone());
        if let Err(e) = self.register_if_unknown(&worker_id, &addr).await {
            debug!("Deferred registration of {}: {}", worker_id, e);
        }
    }

    fn note_heartbeat(&mut self, worker_id: WorkerId) {
        self.observed.insert(worker_id, now_ms());
    }

    async fn register_if_unknown(
        &mut self,
        worker_id: &WorkerId,
        addr: &str,
    ) -> Result<(), CoordinatorError> {
        let known = {
            let state = self.state.read().await;
            state.worker(worker_id).is_some()
        };
        if known {
            return Ok(());
        }
        info!("Registering worker {} at {}", worker_id, addr);
        self.submit(Command::RegisterWorker {
            worker: worker_id.clone(),
            addr: addr.to_string(),
            observed_at_ms: now_ms(),
        })
        .await?;
        Ok(())
    }

    async fn on_tick(&mut self) {
        let now = now_ms();
        if !self.was_leader {
            self.was_leader = true;
            // A new leader has no arrival observations; seed them with the
            // election time so workers aren't condemned for the gap.
            let known: Vec<WorkerId> = {
                let state = self.state.read().await;
                state.workers.keys().cloned().collect()
            };
            for worker_id in known {
                self.observed.insert(worker_id, now);
            }
        }

        let mut heartbeats: Vec<(WorkerId, u64)> = self
            .observed
            .iter()
            .map(|(w, seen)| (w.clone(), *seen))
            .collect();
        heartbeats.sort();

        let tick = Command::Tick {
            now_ms: now,
            heartbeats,
            heartbeat_timeout_ms: self.config.heartbeat_timeout.as_millis() as u64,
            worker_timeout_ms: self.config.worker_timeout.as_millis() as u64,
        };
        match self.submit(tick).await {
            Ok(_) => {}
            Err(CoordinatorError::NotLeader { .. }) => {
                self.was_leader = false;
                return;
            }
            Err(e) => {
                warn!("Tick submission failed: {}", e);
                return;
            }
        }

        let (job_active, overdue, dead, prunable) = {
            let state = self.state.read().await;
            (
                state.active_job().is_some(),
                state.overdue_tasks(now, self.config.task_timeout.as_millis() as u64),
                state.dead_worker_tasks(),
                state.prunable_workers(now, self.config.worker_prune_after.as_millis() as u64),
            )
        };

        if job_active {
            let mut stalled: BTreeSet<TaskId> = BTreeSet::new();
            stalled.extend(overdue);
            stalled.extend(dead);
            for task_id in stalled {
                self.recover_task(task_id).await;
            }
        }
        for worker_id in prunable {
            self.observed.remove(&worker_id);
            if let Err(e) = self.submit(Command::RemoveWorker { worker: worker_id }).await {
                debug!("Worker prune skipped: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Classify a stalled or failed task from filesystem evidence and
    /// submit the recovery command the classification calls for.
    async fn recover_task(&mut self, task_id: TaskId) {
        struct Snapshot {
            job_id: JobId,
            reduce_count: u32,
            attempt: u32,
            worker: Option<WorkerId>,
        }

        let snapshot = {
            let state = self.state.read().await;
            state.active_job().and_then(|job| {
                state.task(task_id).and_then(|task| {
                    matches!(task.state, TaskState::InProgress | TaskState::Failed).then(
                        || Snapshot {
                            job_id: job.id.clone(),
                            reduce_count: job.reduce_count,
                            attempt: task.attempt,
                            worker: task.assigned_worker.clone(),
                        },
                    )
                })
            })
        };
        let Some(snapshot) = snapshot else {
            return; // already recovered or job finished
        };

        match task_id.kind {
            TaskKind::Map => {
                let evidence = match self
                    .layout
                    .map_evidence(task_id.index, snapshot.reduce_count)
                    .await
                {
                    Ok(evidence) => evidence,
                    Err(e) => {
                        error!("Cannot read map evidence for {}: {}", task_id, e);
                        let worker = snapshot.worker.clone().unwrap_or_default();
                        self.fail_job(snapshot.job_id, task_id, &worker, snapshot.attempt, &e)
                            .await;
                        return;
                    }
                };
                match classify_map_failure(&evidence) {
                    RecoveryAction::MarkCompleted => {
                        info!(
                            "Map {} output is durable; completing despite worker failure",
                            task_id.index
                        );
                        let worker = snapshot.worker.clone().unwrap_or_default();
                        if let Err(e) = self
                            .submit(Command::CompleteTask {
                                job_id: snapshot.job_id,
                                task: task_id,
                                worker,
                                attempt: snapshot.attempt,
                            })
                            .await
                        {
                            warn!("Recovery completion for {} not committed: {}", task_id, e);
                        }
                    }
                    RecoveryAction::ResetTask => {
                        info!("Map {} has no durable output; rescheduling", task_id.index);
                        if let Err(e) = self
                            .submit(Command::ResetTask {
                                job_id: snapshot.job_id,
                                task: task_id,
                                attempt: snapshot.attempt,
                            })
                            .await
                        {
                            warn!("Reset for {} not committed: {}", task_id, e);
                        }
                    }
                    RecoveryAction::NoOp | RecoveryAction::Fail => {}
                }
            }
            TaskKind::Reduce => {
                let evidence = match self.layout.reduce_evidence(task_id.index).await {
                    Ok(evidence) => evidence,
                    Err(e) => {
                        error!("Cannot read reduce evidence for {}: {}", task_id, e);
                        let worker = snapshot.worker.clone().unwrap_or_default();
                        self.fail_job(snapshot.job_id, task_id, &worker, snapshot.attempt, &e)
                            .await;
                        return;
                    }
                };
                if let Some(checkpoint_path) = evidence.checkpoint.clone() {
                    info!(
                        "Reduce {} left a checkpoint; replacement will resume",
                        task_id.index
                    );
                    if let Err(e) = self
                        .submit(Command::SetCheckpoint {
                            job_id: snapshot.job_id.clone(),
                            partition: task_id.index,
                            checkpoint_path,
                        })
                        .await
                    {
                        warn!("Checkpoint reference for {} not committed: {}", task_id, e);
                    }
                }
                if classify_reduce_failure(&evidence) == RecoveryAction::ResetTask {
                    if let Err(e) = self
                        .submit(Command::ResetTask {
                            job_id: snapshot.job_id,
                            task: task_id,
                            attempt: snapshot.attempt,
                        })
                        .await
                    {
                        warn!("Reset for {} not committed: {}", task_id, e);
                    }
                }
            }
        }
    }

    /// Re-verify the durable output of completed map tasks and reschedule
    /// any whose intermediate files have gone missing or zero-size.
    async fn sweep_map_corruption(&mut self) {
        let completed: Vec<(JobId, TaskId, u32, u32)> = {
            let state = self.state.read().await;
            match state.active_job() {
                Some(job) => state
                    .tasks
                    .values()
                    .filter(|t| t.id.kind == TaskKind::Map && t.state == TaskState::Completed)
                    .map(|t| (job.id.clone(), t.id, t.attempt, job.reduce_count))
                    .collect(),
                None => Vec::new(),
            }
        };
        for (job_id, task_id, attempt, reduce_count) in completed {
            match self.layout.map_evidence(task_id.index, reduce_count).await {
                Ok(evidence) if !evidence.all_durable() => {
                    warn!(
                        "Intermediate files for completed map {} are corrupt or missing; rerunning",
                        task_id.index
                    );
                    if let Err(e) = self
                        .submit(Command::ResetTask {
                            job_id,
                            task: task_id,
                            attempt,
                        })
                        .await
                    {
                        warn!("Corruption reset for {} not committed: {}", task_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Cannot re-verify map {}: {}", task_id.index, e),
            }
        }
    }

    /// Escalate an unrecoverable condition to a job failure.
    async fn fail_job(
        &mut self,
        job_id: JobId,
        task_id: TaskId,
        worker: &WorkerId,
        attempt: u32,
        cause: &CoordinatorError,
    ) {
        error!("Failing job {}: {}", job_id, cause);
        if let Err(e) = self
            .submit(Command::FailTask {
                job_id,
                task: task_id,
                worker: worker.clone(),
                attempt,
                reason: cause.to_string(),
                fatal: true,
            })
            .await
        {
            error!("Fatal failure for {} not committed: {}", task_id, e);
        }
    }
}
