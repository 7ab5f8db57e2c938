//! In-process request dispatch for one master
//!
//! The dispatcher is the seam between transports and the scheduler:
//! leader-only operations go through the scheduler channel, read-only
//! queries are served straight from this replica's state, and requests
//! landing on a follower come back with the leader hint.

use super::api::CoordinatorApi;
use super::protocol::{
    AssignmentView, HeartbeatRequest, HeartbeatResponse, JobStatusResponse, LeaderResponse,
    ReportTaskRequest, RequestTaskRequest, RequestTaskResponse, SubmitJobRequest,
    SubmitJobResponse, WorkerCountResponse,
};
use crate::consensus::ReplicatedLog;
use crate::error::CoordinatorError;
use crate::state::{MachineState, TaskKind, WorkerId};
use async_trait::async_trait;
use crate::scheduler::SchedulerHandle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One master's request dispatcher.
pub struct Dispatcher {
    handle: SchedulerHandle,
    state: Arc<RwLock<MachineState>>,
    log: Arc<dyn ReplicatedLog>,
}

impl Dispatcher {
    pub fn new(
        handle: SchedulerHandle,
        state: Arc<RwLock<MachineState>>,
        log: Arc<dyn ReplicatedLog>,
    ) -> Self {
        Self { handle, state, log }
    }
}

#[async_trait]
impl CoordinatorApi for Dispatcher {
    async fn submit_job(
        &self,
        request: SubmitJobRequest,
    ) -> Result<SubmitJobResponse, CoordinatorError> {
        self.handle
            .submit_job(request.input_files, request.reduce_hint)
            .await
    }

    async fn request_task(
        &self,
        request: RequestTaskRequest,
    ) -> Result<RequestTaskResponse, CoordinatorError> {
        self.handle
            .request_task(WorkerId::from_string(request.worker_id), request.addr)
            .await
    }

    async fn report_task(&self, request: ReportTaskRequest) -> Result<(), CoordinatorError> {
        self.handle.report_task(request).await
    }

    async fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, CoordinatorError> {
        let worker_id = WorkerId::from_string(request.worker_id);
        let is_leader = self.log.is_leader();
        if is_leader {
            self.handle.heartbeat(worker_id.clone(), request.addr).await?;
        }
        // Served from the local replica either way: followers answer with
        // slightly stale but replicated state plus the leader hint, so a
        // heartbeat landing on a follower is acknowledged, never lost.
        let assignment = {
            let state = self.state.read().await;
            state
                .assignment_of(&worker_id)
                .map(|(task_id, attempt)| AssignmentView {
                    kind: task_id.kind,
                    index: task_id.index,
                    attempt,
                })
        };
        Ok(HeartbeatResponse {
            assignment,
            leader_hint: if is_leader { None } else { self.log.leader_hint() },
        })
    }

    async fn worker_count(&self) -> Result<WorkerCountResponse, CoordinatorError> {
        let state = self.state.read().await;
        let (active, total) = state.worker_counts();
        Ok(WorkerCountResponse { active, total })
    }

    async fn leader(&self) -> Result<LeaderResponse, CoordinatorError> {
        let phase = {
            let state = self.state.read().await;
            state.phase().map(|p| p.to_string())
        };
        Ok(LeaderResponse {
            is_leader: self.log.is_leader(),
            leader_hint: self.log.leader_hint(),
            phase,
        })
    }

    async fn job_status(&self) -> Result<JobStatusResponse, CoordinatorError> {
        let state = self.state.read().await;
        let job = state.job.as_ref().ok_or(CoordinatorError::NoActiveJob)?;
        let (map_completed, map_total) = state.task_counts(TaskKind::Map);
        let (reduce_completed, reduce_total) = state.task_counts(TaskKind::Reduce);
        let submitted_at = DateTime::<Utc>::from_timestamp_millis(job.submitted_at_ms as i64)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        Ok(JobStatusResponse {
            job_id: job.id.to_string(),
            phase: job.phase.to_string(),
            map_completed,
            map_total,
            reduce_completed,
            reduce_total,
            submitted_at,
        })
    }
}
