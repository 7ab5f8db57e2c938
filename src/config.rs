//! Runtime configuration for masters and workers
//!
//! All knobs live in a single [`Config`] value built once at startup and
//! passed by reference; there are no globals. Environment variables cover
//! the deployment-facing settings, everything else has defaults suitable
//! for small clusters and can be adjusted field-by-field in tests.

use crate::error::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default shared-filesystem root for intermediate and output files.
pub const DEFAULT_TMP_PATH: &str = "/tmp/mapreduce";

/// Configuration shared by masters and workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Consensus peer addresses, in cluster order.
    pub raft_addresses: Vec<String>,
    /// Master RPC endpoints, in the same order as `raft_addresses`.
    pub rpc_addresses: Vec<String>,
    /// Shared filesystem root for intermediate and output files.
    pub tmp_path: PathBuf,
    /// Reducer-count fallback used when no workers are registered yet.
    pub worker_count_hint: u32,
    /// Execution deadline for an assigned task.
    pub task_timeout: Duration,
    /// Heartbeat age at which a worker becomes Suspect.
    pub heartbeat_timeout: Duration,
    /// Heartbeat age at which a worker is declared Dead.
    pub worker_timeout: Duration,
    /// Cadence of the leader's replicated clock ticks.
    pub tick_interval: Duration,
    /// How often workers send heartbeats.
    pub heartbeat_interval: Duration,
    /// Base interval workers wait when no task is assignable.
    pub poll_backoff: Duration,
    /// Cap for exponential client backoff.
    pub poll_backoff_max: Duration,
    /// Number of reduce key groups between checkpoints.
    pub checkpoint_stride: usize,
    /// Attempts before a task failure marks the whole job failed.
    pub max_task_attempts: u32,
    /// Verify all partition files exist and are non-empty before accepting
    /// a map completion.
    pub verify_map_output: bool,
    /// How long a Dead worker record is kept before being pruned.
    pub worker_prune_after: Duration,
    /// Bound on queued scheduler requests.
    pub scheduler_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            raft_addresses: vec!["127.0.0.1:7401".to_string()],
            rpc_addresses: vec!["127.0.0.1:7301".to_string()],
            tmp_path: PathBuf::from(DEFAULT_TMP_PATH),
            worker_count_hint: 3,
            task_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            worker_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            poll_backoff: Duration::from_millis(200),
            poll_backoff_max: Duration::from_secs(5),
            checkpoint_stride: 100,
            max_task_attempts: 5,
            verify_map_output: true,
            worker_prune_after: Duration::from_secs(300),
            scheduler_queue_depth: 256,
        }
    }
}

impl Config {
    /// Build a configuration from the environment, falling back to defaults
    /// for anything unset.
    ///
    /// Recognized variables: `RAFT_ADDRESSES`, `RPC_ADDRESSES`, `TMP_PATH`,
    /// `WORKER_COUNT`, and the timeout trio `T_TASK`, `T_HEARTBEAT`,
    /// `T_WORKER` (whole seconds).
    pub fn from_env() -> Result<Self, CoordinatorError> {
        let mut config = Self::default();

        if let Some(list) = env_list("RAFT_ADDRESSES") {
            config.raft_addresses = list;
        }
        if let Some(list) = env_list("RPC_ADDRESSES") {
            config.rpc_addresses = list;
        }
        if let Ok(path) = env::var("TMP_PATH") {
            if !path.trim().is_empty() {
                config.tmp_path = PathBuf::from(path.trim());
            }
        }
        if let Some(count) = env_u64("WORKER_COUNT")? {
            config.worker_count_hint = count as u32;
        }
        if let Some(secs) = env_u64("T_TASK")? {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("T_HEARTBEAT")? {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("T_WORKER")? {
            config.worker_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency. Called by [`Config::from_env`]; tests
    /// that build configs by hand should call it too.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.rpc_addresses.is_empty() {
            return Err(invalid("RPC_ADDRESSES must name at least one master"));
        }
        if !self.raft_addresses.is_empty() && self.raft_addresses.len() != self.rpc_addresses.len()
        {
            return Err(invalid(
                "RAFT_ADDRESSES and RPC_ADDRESSES must have the same length",
            ));
        }
        if self.task_timeout.is_zero()
            || self.heartbeat_timeout.is_zero()
            || self.worker_timeout.is_zero()
        {
            return Err(invalid("timeouts must be positive"));
        }
        if self.heartbeat_timeout >= self.worker_timeout {
            return Err(invalid("T_HEARTBEAT must be shorter than T_WORKER"));
        }
        if self.checkpoint_stride == 0 {
            return Err(invalid("checkpoint stride must be at least 1"));
        }
        if self.max_task_attempts == 0 {
            return Err(invalid("max task attempts must be at least 1"));
        }
        if self.worker_count_hint == 0 {
            return Err(invalid("WORKER_COUNT must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> CoordinatorError {
    CoordinatorError::InvalidConfiguration {
        reason: reason.to_string(),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let list: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, CoordinatorError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| CoordinatorError::InvalidConfiguration {
                reason: format!("{key} must be a whole number, got {raw:?}"),
            }),
        Err(_) => Ok(None),
    }
}
