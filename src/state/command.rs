//! Commands applied through the replicated log
//!
//! Every mutation of job, task, or worker state derives from applying one
//! of these tagged records in commit order. Commands carry all the
//! non-deterministic inputs (wall-clock times, resolved reducer counts) so
//! that applying them is a pure function of the state and the command.

use super::types::{JobId, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A tagged record submitted to the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Create a job with its map and reduce task sets.
    SubmitJob {
        job_id: JobId,
        input_files: Vec<PathBuf>,
        /// Resolved by the leader at submission; fixed for the job's life.
        reduce_count: u32,
        max_task_attempts: u32,
        submitted_at_ms: u64,
    },

    /// Hand an idle task to a worker.
    AssignTask {
        job_id: JobId,
        task: TaskId,
        worker: WorkerId,
        attempt: u32,
        assigned_at_ms: u64,
    },

    /// Record successful completion of an assigned task.
    CompleteTask {
        job_id: JobId,
        task: TaskId,
        worker: WorkerId,
        attempt: u32,
    },

    /// Record a failed attempt; `fatal` marks the whole job failed.
    FailTask {
        job_id: JobId,
        task: TaskId,
        worker: WorkerId,
        attempt: u32,
        reason: String,
        fatal: bool,
    },

    /// Return a task to the idle pool for reassignment.
    ResetTask {
        job_id: JobId,
        task: TaskId,
        attempt: u32,
    },

    /// Create or refresh a worker record.
    RegisterWorker {
        worker: WorkerId,
        addr: String,
        observed_at_ms: u64,
    },

    /// Drop a long-dead worker record.
    RemoveWorker { worker: WorkerId },

    /// Attach a durable checkpoint reference to a reduce task.
    SetCheckpoint {
        job_id: JobId,
        partition: u32,
        checkpoint_path: PathBuf,
    },

    /// Periodic leader clock. Carries the leader's observed heartbeat
    /// arrival times and thresholds so liveness transitions are identical
    /// on every replica.
    Tick {
        now_ms: u64,
        heartbeats: Vec<(WorkerId, u64)>,
        heartbeat_timeout_ms: u64,
        worker_timeout_ms: u64,
    },
}

impl Command {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::SubmitJob { .. } => "SubmitJob",
            Command::AssignTask { .. } => "AssignTask",
            Command::CompleteTask { .. } => "CompleteTask",
            Command::FailTask { .. } => "FailTask",
            Command::ResetTask { .. } => "ResetTask",
            Command::RegisterWorker { .. } => "RegisterWorker",
            Command::RemoveWorker { .. } => "RemoveWorker",
            Command::SetCheckpoint { .. } => "SetCheckpoint",
            Command::Tick { .. } => "Tick",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_round_trip_through_json() {
        let commands = vec![
            Command::SubmitJob {
                job_id: JobId::from_string("job-1".to_string()),
                input_files: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
                reduce_count: 2,
                max_task_attempts: 5,
                submitted_at_ms: 1_000,
            },
            Command::AssignTask {
                job_id: JobId::from_string("job-1".to_string()),
                task: TaskId::map(0),
                worker: WorkerId::from_string("worker-a".to_string()),
                attempt: 1,
                assigned_at_ms: 2_000,
            },
            Command::Tick {
                now_ms: 3_000,
                heartbeats: vec![(WorkerId::from_string("worker-a".to_string()), 2_500)],
                heartbeat_timeout_ms: 5_000,
                worker_timeout_ms: 30_000,
            },
        ];
        for command in commands {
            let json = serde_json::to_string(&command).unwrap();
            let back: Command = serde_json::from_str(&json).unwrap();
            assert_eq!(back, command);
        }
    }

    #[test]
    fn test_command_json_is_tagged() {
        let command = Command::RemoveWorker {
            worker: WorkerId::from_string("worker-a".to_string()),
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"type\":\"RemoveWorker\""));
    }

    #[test]
    fn test_kind_names() {
        let command = Command::Tick {
            now_ms: 0,
            heartbeats: vec![],
            heartbeat_timeout_ms: 1,
            worker_timeout_ms: 2,
        };
        assert_eq!(command.kind(), "Tick");
    }
}
