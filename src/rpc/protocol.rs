//! Request and response types for the coordinator RPC surface
//!
//! Transport-neutral serde types. Every response travels inside an
//! [`Envelope`] whose `not_leader` field, when set, names the current
//! leader so callers can retarget.

use crate::error::CoordinatorError;
use crate::state::types::TaskKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Uniform response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    /// Set when the receiving master is not the leader; names the leader
    /// if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_leader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(result: T) -> Self {
        Self {
            result: Some(result),
            not_leader: None,
            error: None,
        }
    }

    pub fn redirect(hint: Option<String>) -> Self {
        Self {
            result: None,
            not_leader: Some(hint.unwrap_or_default()),
            error: None,
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            result: None,
            not_leader: None,
            error: Some(message),
        }
    }

    pub fn from_error(err: &CoordinatorError) -> Self {
        match err {
            CoordinatorError::NotLeader { hint } => Self::redirect(hint.clone()),
            other => Self::failure(other.to_string()),
        }
    }

    /// Unwrap into the caller-side error taxonomy.
    pub fn into_result(self) -> Result<T, CoordinatorError> {
        if let Some(hint) = self.not_leader {
            let hint = if hint.is_empty() { None } else { Some(hint) };
            return Err(CoordinatorError::NotLeader { hint });
        }
        if let Some(message) = self.error {
            return Err(CoordinatorError::Remote { message });
        }
        self.result.ok_or_else(|| CoordinatorError::Remote {
            message: "empty response envelope".to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub input_files: Vec<PathBuf>,
    /// Requested reducer count; resolved dynamically when absent.
    pub reduce_hint: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub reduce_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTaskRequest {
    pub worker_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTaskResponse {
    pub task: Option<TaskAssignment>,
    /// How long to wait before polling again when no task was assigned.
    pub retry_after_ms: u64,
}

/// Everything a worker needs to execute one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub job_id: String,
    pub kind: TaskKind,
    pub index: u32,
    pub attempt: u32,
    /// Input file; map tasks only.
    pub input_path: Option<PathBuf>,
    pub map_count: u32,
    pub reduce_count: u32,
    /// Durable progress record to resume from; reduce tasks only.
    pub checkpoint_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTaskRequest {
    pub job_id: String,
    pub worker_id: String,
    pub kind: TaskKind,
    pub index: u32,
    pub attempt: u32,
    pub outcome: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub addr: String,
}

/// The leader's view of a worker's current assignment, echoed back on
/// heartbeats so a worker can notice its task was reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentView {
    pub kind: TaskKind,
    pub index: u32,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub assignment: Option<AssignmentView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCountResponse {
    pub active: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub is_leader: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<String>,
    /// Current job phase, when a job exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub phase: String,
    pub map_completed: u32,
    pub map_total: u32,
    pub reduce_completed: u32,
    pub reduce_total: u32,
    pub submitted_at: String,
}
