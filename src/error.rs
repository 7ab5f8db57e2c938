//! Structured error types for coordination operations
//!
//! Provides error categorization across masters, workers, and clients,
//! with enough context for callers to decide between retrying, retargeting
//! to another master, and surfacing the failure.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for coordination operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The contacted master is not the leader; `hint` names the leader if known.
    #[error("request must go to the leader")]
    NotLeader { hint: Option<String> },

    #[error("job {job_id} is still active; concurrent submissions are rejected")]
    JobAlreadyActive { job_id: String },

    #[error("no job has been submitted")]
    NoActiveJob,

    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("consensus unavailable: {reason}")]
    ConsensusUnavailable { reason: String },

    /// The scheduler loop has shut down and can no longer accept requests.
    #[error("scheduler is not running")]
    SchedulerUnavailable,

    #[error("storage operation failed at {path}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// Transient transport failure; callers back off and retry.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// An error reported by a remote master through the RPC envelope.
    #[error("remote error: {message}")]
    Remote { message: String },

    /// A task could not run: a user map/reduce function failed, or the
    /// assignment itself was unusable.
    #[error("task execution failed: {reason}")]
    TaskExecution { reason: String },
}

impl CoordinatorError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Failure inside a task, phrased for the completion report.
    pub fn task_execution(reason: impl Into<String>) -> Self {
        Self::TaskExecution {
            reason: reason.into(),
        }
    }

    /// Whether a caller should retry the operation, possibly against
    /// another master.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::Transport { .. } | Self::ConsensusUnavailable { .. }
        )
    }
}
