//! Replicated-log seam between masters and the consensus provider
//!
//! The consensus module owns leader election and the committed command
//! log; masters interact with it only through [`ReplicatedLog`]. The
//! in-process [`local::LocalCluster`] implementation backs single-master
//! deployments and deterministic failover tests; an external Raft cluster
//! plugs in behind the same trait using the `RAFT_ADDRESSES`
//! configuration.

use crate::error::CoordinatorError;
use crate::state::Command;
use async_trait::async_trait;
use thiserror::Error;

pub mod local;

pub use local::{LocalCluster, LocalNode};

/// Why a submission was not committed.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// This node is not the leader; `hint` names the leader's RPC address
    /// when known.
    #[error("this node is not the leader")]
    NotLeader { hint: Option<String> },

    #[error("consensus unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<SubmitError> for CoordinatorError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::NotLeader { hint } => CoordinatorError::NotLeader { hint },
            SubmitError::Unavailable { reason } => CoordinatorError::ConsensusUnavailable { reason },
        }
    }
}

/// Handle to the replicated command log held by one master.
///
/// `submit` blocks until the command is committed and applied on this
/// node's replica, so a caller that reads state after a successful submit
/// observes its own write.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Append a command on the leader; returns the committed log index.
    async fn submit(&self, command: Command) -> Result<u64, SubmitError>;

    /// Local, non-replicated leadership check.
    fn is_leader(&self) -> bool;

    /// RPC address of the current leader, if known.
    fn leader_hint(&self) -> Option<String>;
}
