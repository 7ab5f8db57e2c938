//! Deterministic application of committed commands
//!
//! Every replica holds a [`MachineState`] and applies commands in commit
//! order. Application is a pure function of the state and the command:
//! all wall-clock input arrives inside the commands themselves, and
//! anything that does not validate against the current state is an
//! explicit no-op rather than an error, which is what makes duplicate
//! submissions and stale reports safe.

use super::command::Command;
use super::types::{
    Job, JobId, JobPhase, Task, TaskId, TaskKind, TaskState, WorkerId, WorkerRecord, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Result of applying one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The command did not validate against the current state and changed
    /// nothing. The reason is for logging only.
    Ignored(&'static str),
}

/// The authoritative job/task/worker state, identical on every replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub job: Option<Job>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub workers: BTreeMap<WorkerId, WorkerRecord>,
    pub last_applied: u64,
    pub last_tick_ms: u64,
}

impl MachineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a committed command. Must be called in commit order.
    pub fn apply(&mut self, command: &Command, index: u64) -> ApplyOutcome {
        self.last_applied = index;
        let outcome = match command {
            Command::SubmitJob {
                job_id,
                input_files,
                reduce_count,
                max_task_attempts,
                submitted_at_ms,
            } => self.apply_submit_job(
                job_id.clone(),
                input_files,
                *reduce_count,
                *max_task_attempts,
                *submitted_at_ms,
            ),
            Command::AssignTask {
                job_id,
                task,
                worker,
                attempt,
                assigned_at_ms,
            } => self.apply_assign_task(job_id, *task, worker, *attempt, *assigned_at_ms),
            Command::CompleteTask {
                job_id,
                task,
                worker,
                attempt,
            } => self.apply_complete_task(job_id, *task, worker, *attempt),
            Command::FailTask {
                job_id,
                task,
                worker,
                attempt,
                reason,
                fatal,
            } => self.apply_fail_task(job_id, *task, worker, *attempt, reason, *fatal),
            Command::ResetTask {
                job_id,
                task,
                attempt,
            } => self.apply_reset_task(job_id, *task, *attempt),
            Command::RegisterWorker {
                worker,
                addr,
                observed_at_ms,
            } => self.apply_register_worker(worker, addr, *observed_at_ms),
            Command::RemoveWorker { worker } => self.apply_remove_worker(worker),
            Command::SetCheckpoint {
                job_id,
                partition,
                checkpoint_path,
            } => self.apply_set_checkpoint(job_id, *partition, checkpoint_path.clone()),
            Command::Tick {
                now_ms,
                heartbeats,
                heartbeat_timeout_ms,
                worker_timeout_ms,
            } => self.apply_tick(*now_ms, heartbeats, *heartbeat_timeout_ms, *worker_timeout_ms),
        };
        if let ApplyOutcome::Ignored(reason) = outcome {
            debug!("Ignored {} at index {}: {}", command.kind(), index, reason);
        }
        outcome
    }

    fn apply_submit_job(
        &mut self,
        job_id: JobId,
        input_files: &[std::path::PathBuf],
        reduce_count: u32,
        max_task_attempts: u32,
        submitted_at_ms: u64,
    ) -> ApplyOutcome {
        if self.job.as_ref().is_some_and(|j| j.is_active()) {
            return ApplyOutcome::Ignored("a job is already active");
        }
        if input_files.is_empty() || reduce_count == 0 {
            return ApplyOutcome::Ignored("job must have inputs and at least one reducer");
        }

        self.tasks.clear();
        for (index, input) in input_files.iter().enumerate() {
            let task = Task::new_map(index as u32, input.clone());
            self.tasks.insert(task.id, task);
        }
        for partition in 0..reduce_count {
            let task = Task::new_reduce(partition);
            self.tasks.insert(task.id, task);
        }
        for worker in self.workers.values_mut() {
            worker.assigned = None;
        }
        self.job = Some(Job {
            id: job_id,
            input_files: input_files.to_vec(),
            reduce_count,
            max_task_attempts,
            phase: JobPhase::Map,
            submitted_at_ms,
        });
        ApplyOutcome::Applied
    }

    fn apply_assign_task(
        &mut self,
        job_id: &JobId,
        task_id: TaskId,
        worker_id: &WorkerId,
        attempt: u32,
        assigned_at_ms: u64,
    ) -> ApplyOutcome {
        if !self.job_is(job_id) {
            return ApplyOutcome::Ignored("job is not active");
        }
        if task_id.kind == TaskKind::Reduce && !self.map_barrier_satisfied() {
            return ApplyOutcome::Ignored("map barrier not satisfied");
        }
        let Some(task) = self.tasks.get(&task_id) else {
            return ApplyOutcome::Ignored("unknown task");
        };
        if task.state == TaskState::InProgress
            && task.attempt == attempt
            && task.assigned_worker.as_ref() == Some(worker_id)
        {
            return ApplyOutcome::Ignored("duplicate assignment");
        }
        if task.state != TaskState::Idle {
            return ApplyOutcome::Ignored("task is not idle");
        }
        if attempt != task.attempt + 1 {
            return ApplyOutcome::Ignored("assignment attempt out of sequence");
        }
        match self.workers.get(worker_id) {
            None => return ApplyOutcome::Ignored("unknown worker"),
            Some(w) if w.status == WorkerStatus::Dead => {
                return ApplyOutcome::Ignored("worker is dead")
            }
            Some(w) if w.assigned.is_some() => {
                return ApplyOutcome::Ignored("worker already has a task")
            }
            Some(_) => {}
        }

        let task = self.tasks.get_mut(&task_id).expect("checked above");
        task.state = TaskState::InProgress;
        task.assigned_worker = Some(worker_id.clone());
        task.assigned_at_ms = Some(assigned_at_ms);
        task.attempt = attempt;
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.assigned = Some(task_id);
        }
        ApplyOutcome::Applied
    }

    fn apply_complete_task(
        &mut self,
        job_id: &JobId,
        task_id: TaskId,
        worker_id: &WorkerId,
        attempt: u32,
    ) -> ApplyOutcome {
        if !self.job_is(job_id) {
            return ApplyOutcome::Ignored("job is not active");
        }
        let Some(task) = self.tasks.get(&task_id) else {
            return ApplyOutcome::Ignored("unknown task");
        };
        if task.attempt != attempt {
            return ApplyOutcome::Ignored("stale completion attempt");
        }
        let valid = match task.state {
            TaskState::InProgress => task.assigned_worker.as_ref() == Some(worker_id),
            // Evidence-based completion after a reported failure.
            TaskState::Failed => true,
            TaskState::Completed => return ApplyOutcome::Ignored("task already completed"),
            TaskState::Idle => false,
        };
        if !valid {
            return ApplyOutcome::Ignored("completion does not match assignment");
        }

        let task = self.tasks.get_mut(&task_id).expect("checked above");
        task.state = TaskState::Completed;
        task.assigned_at_ms = None;
        let assignee = task.assigned_worker.clone();
        if let Some(worker) = assignee.as_ref().and_then(|w| self.workers.get_mut(w)) {
            if worker.assigned == Some(task_id) {
                worker.assigned = None;
            }
        }

        // Phase advancement rides on the completing command so every
        // replica transitions at the same log index.
        match task_id.kind {
            TaskKind::Map => {
                if self.phase() == Some(JobPhase::Map) && self.map_barrier_satisfied() {
                    if let Some(job) = self.job.as_mut() {
                        job.phase = JobPhase::Reduce;
                    }
                }
            }
            TaskKind::Reduce => {
                if self.all_completed(TaskKind::Reduce) {
                    if let Some(job) = self.job.as_mut() {
                        job.phase = JobPhase::Done;
                    }
                }
            }
        }
        ApplyOutcome::Applied
    }

    fn apply_fail_task(
        &mut self,
        job_id: &JobId,
        task_id: TaskId,
        worker_id: &WorkerId,
        attempt: u32,
        reason: &str,
        fatal: bool,
    ) -> ApplyOutcome {
        if !self.job_is(job_id) {
            return ApplyOutcome::Ignored("job is not active");
        }
        let Some(task) = self.tasks.get(&task_id) else {
            return ApplyOutcome::Ignored("unknown task");
        };
        let valid = match task.state {
            TaskState::InProgress => {
                task.attempt == attempt && task.assigned_worker.as_ref() == Some(worker_id)
            }
            // Escalation to fatal after an already-recorded failure.
            TaskState::Failed => task.attempt == attempt && fatal,
            TaskState::Idle | TaskState::Completed => false,
        };
        if !valid {
            return ApplyOutcome::Ignored("failure does not match assignment");
        }

        debug!("Task {} failed at attempt {}: {}", task_id, attempt, reason);
        let max_attempts = self.job.as_ref().map(|j| j.max_task_attempts).unwrap_or(1);
        let task = self.tasks.get_mut(&task_id).expect("checked above");
        task.state = TaskState::Failed;
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.assigned == Some(task_id) {
                worker.assigned = None;
            }
        }
        if fatal || attempt >= max_attempts {
            if let Some(job) = self.job.as_mut() {
                job.phase = JobPhase::Failed;
            }
        }
        ApplyOutcome::Applied
    }

    fn apply_reset_task(
        &mut self,
        job_id: &JobId,
        task_id: TaskId,
        attempt: u32,
    ) -> ApplyOutcome {
        if !self.job_is(job_id) {
            return ApplyOutcome::Ignored("job is not active");
        }
        let Some(task) = self.tasks.get(&task_id) else {
            return ApplyOutcome::Ignored("unknown task");
        };
        if task.attempt != attempt {
            return ApplyOutcome::Ignored("stale reset attempt");
        }
        match (task.state, task_id.kind) {
            (TaskState::InProgress | TaskState::Failed, _) => {}
            // Recovery from corrupted intermediate files: a completed map
            // task is only un-completed by explicit analyzer decision.
            (TaskState::Completed, TaskKind::Map) => {}
            (TaskState::Completed, TaskKind::Reduce) => {
                return ApplyOutcome::Ignored("completed reduce output is final")
            }
            (TaskState::Idle, _) => return ApplyOutcome::Ignored("task already idle"),
        }

        let was_completed_map =
            task.state == TaskState::Completed && task_id.kind == TaskKind::Map;
        let assignee = task.assigned_worker.clone();
        let task = self.tasks.get_mut(&task_id).expect("checked above");
        task.state = TaskState::Idle;
        task.assigned_worker = None;
        task.assigned_at_ms = None;
        if let Some(worker) = assignee.as_ref().and_then(|w| self.workers.get_mut(w)) {
            if worker.assigned == Some(task_id) {
                worker.assigned = None;
            }
        }
        if was_completed_map {
            if let Some(job) = self.job.as_mut() {
                if job.phase == JobPhase::Reduce {
                    job.phase = JobPhase::Map;
                }
            }
        }
        ApplyOutcome::Applied
    }

    fn apply_register_worker(
        &mut self,
        worker_id: &WorkerId,
        addr: &str,
        observed_at_ms: u64,
    ) -> ApplyOutcome {
        let entry = self
            .workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerRecord {
                id: worker_id.clone(),
                addr: addr.to_string(),
                last_heartbeat_ms: observed_at_ms,
                status: WorkerStatus::Active,
                assigned: None,
            });
        entry.addr = addr.to_string();
        entry.last_heartbeat_ms = entry.last_heartbeat_ms.max(observed_at_ms);
        entry.status = WorkerStatus::Active;
        ApplyOutcome::Applied
    }

    fn apply_remove_worker(&mut self, worker_id: &WorkerId) -> ApplyOutcome {
        match self.workers.get(worker_id) {
            None => ApplyOutcome::Ignored("unknown worker"),
            Some(w) if w.assigned.is_some() => {
                ApplyOutcome::Ignored("worker still has an assignment")
            }
            Some(_) => {
                self.workers.remove(worker_id);
                ApplyOutcome::Applied
            }
        }
    }

    fn apply_set_checkpoint(
        &mut self,
        job_id: &JobId,
        partition: u32,
        checkpoint_path: std::path::PathBuf,
    ) -> ApplyOutcome {
        if !self.job_is(job_id) {
            return ApplyOutcome::Ignored("job is not active");
        }
        match self.tasks.get_mut(&TaskId::reduce(partition)) {
            None => ApplyOutcome::Ignored("unknown reduce partition"),
            Some(task) if task.state == TaskState::Completed => {
                ApplyOutcome::Ignored("reduce task already completed")
            }
            Some(task) => {
                task.checkpoint = Some(checkpoint_path);
                ApplyOutcome::Applied
            }
        }
    }

    fn apply_tick(
        &mut self,
        now_ms: u64,
        heartbeats: &[(WorkerId, u64)],
        heartbeat_timeout_ms: u64,
        worker_timeout_ms: u64,
    ) -> ApplyOutcome {
        if now_ms < self.last_tick_ms {
            return ApplyOutcome::Ignored("tick timestamp went backwards");
        }
        self.last_tick_ms = now_ms;
        for (worker_id, seen_ms) in heartbeats {
            if let Some(worker) = self.workers.get_mut(worker_id) {
                worker.last_heartbeat_ms = worker.last_heartbeat_ms.max(*seen_ms);
            }
        }
        for worker in self.workers.values_mut() {
            let age = now_ms.saturating_sub(worker.last_heartbeat_ms);
            worker.status = if age >= worker_timeout_ms {
                WorkerStatus::Dead
            } else if age >= heartbeat_timeout_ms {
                WorkerStatus::Suspect
            } else {
                WorkerStatus::Active
            };
        }
        ApplyOutcome::Applied
    }

    fn job_is(&self, job_id: &JobId) -> bool {
        self.job
            .as_ref()
            .is_some_and(|j| j.is_active() && &j.id == job_id)
    }

    // ------------------------------------------------------------------
    // Read-only queries
    // ------------------------------------------------------------------

    pub fn active_job(&self) -> Option<&Job> {
        self.job.as_ref().filter(|j| j.is_active())
    }

    pub fn phase(&self) -> Option<JobPhase> {
        self.job.as_ref().map(|j| j.phase)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(id)
    }

    /// True when every map task is Completed.
    pub fn map_barrier_satisfied(&self) -> bool {
        self.all_completed(TaskKind::Map)
    }

    fn all_completed(&self, kind: TaskKind) -> bool {
        self.tasks
            .values()
            .filter(|t| t.id.kind == kind)
            .all(|t| t.state == TaskState::Completed)
    }

    /// Lowest-index idle task of the given kind.
    pub fn next_idle_task(&self, kind: TaskKind) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.id.kind == kind && t.is_idle())
            .min_by_key(|t| t.id.index)
    }

    /// (completed, total) for one task kind.
    pub fn task_counts(&self, kind: TaskKind) -> (u32, u32) {
        let mut completed = 0;
        let mut total = 0;
        for task in self.tasks.values().filter(|t| t.id.kind == kind) {
            total += 1;
            if task.state == TaskState::Completed {
                completed += 1;
            }
        }
        (completed, total)
    }

    pub fn active_worker_count(&self) -> u32 {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Active)
            .count() as u32
    }

    /// (active, total) worker counts.
    pub fn worker_counts(&self) -> (u32, u32) {
        (self.active_worker_count(), self.workers.len() as u32)
    }

    /// The committed in-progress assignment of a worker, if any.
    pub fn assignment_of(&self, worker_id: &WorkerId) -> Option<(TaskId, u32)> {
        let worker = self.workers.get(worker_id)?;
        let task_id = worker.assigned?;
        let task = self.tasks.get(&task_id)?;
        if task.state == TaskState::InProgress
            && task.assigned_worker.as_ref() == Some(worker_id)
        {
            Some((task_id, task.attempt))
        } else {
            None
        }
    }

    /// In-progress tasks whose execution deadline has passed.
    pub fn overdue_tasks(&self, now_ms: u64, task_timeout_ms: u64) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::InProgress)
            .filter(|t| {
                t.assigned_at_ms
                    .is_some_and(|at| now_ms.saturating_sub(at) > task_timeout_ms)
            })
            .map(|t| t.id)
            .collect()
    }

    /// In-progress tasks held by workers declared Dead.
    pub fn dead_worker_tasks(&self) -> Vec<TaskId> {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Dead)
            .filter_map(|w| w.assigned)
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.state == TaskState::InProgress)
            })
            .collect()
    }

    /// Dead, unassigned workers whose record has outlived its usefulness.
    pub fn prunable_workers(&self, now_ms: u64, prune_after_ms: u64) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Dead && w.assigned.is_none())
            .filter(|w| now_ms.saturating_sub(w.last_heartbeat_ms) > prune_after_ms)
            .map(|w| w.id.clone())
            .collect()
    }
}
