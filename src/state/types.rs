//! Replicated job, task, and worker records
//!
//! These types are owned by the replicated state machine: every master
//! holds the authoritative copy and mutates it only by applying committed
//! commands. Everything here is serde-serializable because it travels
//! through the log and through snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh job id.
    pub fn new() -> Self {
        Self(format!("job-{}", uuid::Uuid::new_v4()))
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new() -> Self {
        Self(format!("worker-{}", uuid::Uuid::new_v4()))
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Map,
    Reduce,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Map => write!(f, "map"),
            TaskKind::Reduce => write!(f, "reduce"),
        }
    }
}

/// Task identity within a job: kind plus index.
///
/// Serialized as `"map-3"` / `"reduce-0"` so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub kind: TaskKind,
    pub index: u32,
}

impl TaskId {
    pub fn map(index: u32) -> Self {
        Self {
            kind: TaskKind::Map,
            index,
        }
    }

    pub fn reduce(index: u32) -> Self {
        Self {
            kind: TaskKind::Reduce,
            index,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.index)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, index) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("malformed task id {s:?}"))?;
        let index: u32 = index
            .parse()
            .map_err(|_| format!("malformed task index in {s:?}"))?;
        match kind {
            "map" => Ok(TaskId::map(index)),
            "reduce" => Ok(TaskId::reduce(index)),
            _ => Err(format!("unknown task kind in {s:?}")),
        }
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Idle,
    InProgress,
    Completed,
    Failed,
}

/// Kind-specific task input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskPayload {
    Map { input_path: PathBuf },
    Reduce { partition: u32 },
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub state: TaskState,
    pub assigned_worker: Option<WorkerId>,
    pub assigned_at_ms: Option<u64>,
    /// Monotonic per-task counter; each assignment increments it so stale
    /// reports are recognizable.
    pub attempt: u32,
    /// Durable progress record for reduce tasks, once one is known.
    pub checkpoint: Option<PathBuf>,
}

impl Task {
    pub fn new_map(index: u32, input_path: PathBuf) -> Self {
        Self {
            id: TaskId::map(index),
            payload: TaskPayload::Map { input_path },
            state: TaskState::Idle,
            assigned_worker: None,
            assigned_at_ms: None,
            attempt: 0,
            checkpoint: None,
        }
    }

    pub fn new_reduce(partition: u32) -> Self {
        Self {
            id: TaskId::reduce(partition),
            payload: TaskPayload::Reduce { partition },
            state: TaskState::Idle,
            assigned_worker: None,
            assigned_at_ms: None,
            attempt: 0,
            checkpoint: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == TaskState::Idle
    }

    pub fn input_path(&self) -> Option<&PathBuf> {
        match &self.payload {
            TaskPayload::Map { input_path } => Some(input_path),
            TaskPayload::Reduce { .. } => None,
        }
    }
}

/// Worker liveness states driven by heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Active,
    /// Heartbeat overdue; still eligible to complete its task.
    Suspect,
    Dead,
}

/// Replicated record of a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub addr: String,
    pub last_heartbeat_ms: u64,
    pub status: WorkerStatus,
    /// At most one task at a time.
    pub assigned: Option<TaskId>,
}

/// Job phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Map,
    Reduce,
    Done,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Map => write!(f, "map"),
            JobPhase::Reduce => write!(f, "reduce"),
            JobPhase::Done => write!(f, "done"),
            JobPhase::Failed => write!(f, "failed"),
        }
    }
}

/// The replicated job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_files: Vec<PathBuf>,
    /// Fixed at submission for the life of the job.
    pub reduce_count: u32,
    pub max_task_attempts: u32,
    pub phase: JobPhase,
    pub submitted_at_ms: u64,
}

impl Job {
    pub fn map_count(&self) -> u32 {
        self.input_files.len() as u32
    }

    /// Whether the job is still accepting work.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, JobPhase::Map | JobPhase::Reduce)
    }
}
