//! In-process replicated log with explicit leadership control
//!
//! All replicas live in one process and share a single committed log. A
//! submission on the leader appends to the log and applies the command to
//! every replica's state under the log lock, so replicas never diverge and
//! commit order equals apply order. Leadership moves only by explicit
//! transfer, which is what failover tests need: deterministic elections.

use super::{ReplicatedLog, SubmitError};
use crate::error::CoordinatorError;
use crate::state::{snapshot, Command, MachineState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

struct Replica {
    rpc_addr: String,
    state: Arc<RwLock<MachineState>>,
}

struct ClusterInner {
    log: Mutex<Vec<Command>>,
    leader: AtomicUsize,
    replicas: Vec<Replica>,
}

/// A set of in-process replicas sharing one committed log.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    /// Create one replica per RPC address, all starting from empty state,
    /// with replica 0 as the initial leader.
    pub fn new(rpc_addresses: Vec<String>) -> Self {
        let replicas = rpc_addresses
            .into_iter()
            .map(|rpc_addr| Replica {
                rpc_addr,
                state: Arc::new(RwLock::new(MachineState::new())),
            })
            .collect();
        Self {
            inner: Arc::new(ClusterInner {
                log: Mutex::new(Vec::new()),
                leader: AtomicUsize::new(0),
                replicas,
            }),
        }
    }

    /// Single-replica cluster for one-master deployments.
    pub fn single(rpc_addr: impl Into<String>) -> (Self, LocalNode) {
        let cluster = Self::new(vec![rpc_addr.into()]);
        let node = cluster.node(0);
        (cluster, node)
    }

    pub fn node(&self, index: usize) -> LocalNode {
        assert!(index < self.inner.replicas.len(), "replica index out of range");
        LocalNode {
            inner: self.inner.clone(),
            index,
        }
    }

    pub fn state(&self, index: usize) -> Arc<RwLock<MachineState>> {
        self.inner.replicas[index].state.clone()
    }

    pub fn leader_index(&self) -> usize {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Move leadership to another replica, as a consensus election would.
    pub fn transfer_leadership(&self, to: usize) {
        assert!(to < self.inner.replicas.len(), "replica index out of range");
        let from = self.inner.leader.swap(to, Ordering::SeqCst);
        info!(
            "Leadership transferred from {} to {}",
            self.inner.replicas[from].rpc_addr, self.inner.replicas[to].rpc_addr
        );
    }

    /// Committed log length.
    pub async fn committed(&self) -> u64 {
        self.inner.log.lock().await.len() as u64
    }

    /// Capture one replica's full state.
    pub async fn snapshot(&self, index: usize) -> Result<Vec<u8>, CoordinatorError> {
        let state = self.inner.replicas[index].state.read().await;
        snapshot::encode(&state)
    }

    /// Replace one replica's state wholesale from a snapshot.
    pub async fn restore(&self, index: usize, bytes: &[u8]) -> Result<(), CoordinatorError> {
        let restored = snapshot::decode(bytes)?;
        let mut state = self.inner.replicas[index].state.write().await;
        *state = restored;
        Ok(())
    }
}

/// One replica's handle to the shared log.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<ClusterInner>,
    index: usize,
}

impl LocalNode {
    pub fn rpc_addr(&self) -> &str {
        &self.inner.replicas[self.index].rpc_addr
    }

    /// This replica's state handle, for serving reads.
    pub fn state(&self) -> Arc<RwLock<MachineState>> {
        self.inner.replicas[self.index].state.clone()
    }
}

#[async_trait]
impl ReplicatedLog for LocalNode {
    async fn submit(&self, command: Command) -> Result<u64, SubmitError> {
        let leader = self.inner.leader.load(Ordering::SeqCst);
        if leader != self.index {
            return Err(SubmitError::NotLeader {
                hint: Some(self.inner.replicas[leader].rpc_addr.clone()),
            });
        }

        let mut log = self.inner.log.lock().await;
        // Leadership may have moved while waiting for the log lock.
        let leader = self.inner.leader.load(Ordering::SeqCst);
        if leader != self.index {
            return Err(SubmitError::NotLeader {
                hint: Some(self.inner.replicas[leader].rpc_addr.clone()),
            });
        }
        log.push(command.clone());
        let index = log.len() as u64;
        debug!("Committed {} at index {}", command.kind(), index);
        for replica in &self.inner.replicas {
            let mut state = replica.state.write().await;
            state.apply(&command, index);
        }
        Ok(index)
    }

    fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst) == self.index
    }

    fn leader_hint(&self) -> Option<String> {
        let leader = self.inner.leader.load(Ordering::SeqCst);
        Some(self.inner.replicas[leader].rpc_addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::WorkerId;

    fn register(worker: &str) -> Command {
        Command::RegisterWorker {
            worker: WorkerId::from_string(worker.to_string()),
            addr: "127.0.0.1:0".to_string(),
            observed_at_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_submit_applies_to_every_replica() {
        let cluster = LocalCluster::new(vec![
            "m0:1".to_string(),
            "m1:1".to_string(),
            "m2:1".to_string(),
        ]);
        let leader = cluster.node(0);
        leader.submit(register("worker-a")).await.unwrap();

        for index in 0..3 {
            let state = cluster.state(index);
            let state = state.read().await;
            assert_eq!(state.workers.len(), 1);
            assert_eq!(state.last_applied, 1);
        }
    }

    #[tokio::test]
    async fn test_follower_submission_is_redirected() {
        let cluster = LocalCluster::new(vec!["m0:1".to_string(), "m1:1".to_string()]);
        let follower = cluster.node(1);
        let err = follower.submit(register("worker-a")).await.unwrap_err();
        match err {
            SubmitError::NotLeader { hint } => assert_eq!(hint.as_deref(), Some("m0:1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leadership_transfer() {
        let cluster = LocalCluster::new(vec!["m0:1".to_string(), "m1:1".to_string()]);
        assert!(cluster.node(0).is_leader());
        assert!(!cluster.node(1).is_leader());

        cluster.transfer_leadership(1);
        assert!(!cluster.node(0).is_leader());
        assert!(cluster.node(1).is_leader());

        // The old leader now gets redirected to the new one.
        let err = cluster.node(0).submit(register("worker-a")).await.unwrap_err();
        match err {
            SubmitError::NotLeader { hint } => assert_eq!(hint.as_deref(), Some("m1:1")),
            other => panic!("unexpected error: {other:?}"),
        }
        cluster.node(1).submit(register("worker-a")).await.unwrap();
        assert_eq!(cluster.committed().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let (cluster, node) = LocalCluster::single("m0:1");
        node.submit(register("worker-a")).await.unwrap();
        node.submit(register("worker-b")).await.unwrap();

        let snapshot_bytes = cluster.snapshot(0).await.unwrap();
        node.submit(register("worker-c")).await.unwrap();
        cluster.restore(0, &snapshot_bytes).await.unwrap();

        let state = cluster.state(0);
        let state = state.read().await;
        assert_eq!(state.workers.len(), 2);
        assert_eq!(state.last_applied, 2);
    }
}
