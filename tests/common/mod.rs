//! Common test harness: in-process master clusters and workers
//!
//! Builds a full coordination stack inside one process: a replica set over
//! the in-process log, a master (scheduler + dispatcher) per replica, and
//! routing clients that exercise the same leader-retargeting path real
//! workers use, all over a temp-dir shared filesystem.

use gristmill::config::Config;
use gristmill::consensus::LocalCluster;
use gristmill::master::Master;
use gristmill::rpc::protocol::JobStatusResponse;
use gristmill::rpc::{CoordinatorApi, RoutingClient};
use gristmill::storage::StorageLayout;
use gristmill::userfns::WordCount;
use gristmill::worker::WorkerRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Timeouts tuned so liveness transitions land within a test's patience.
pub fn test_config(dir: &TempDir, replicas: usize) -> Config {
    let mut config = Config::default();
    config.rpc_addresses = (0..replicas).map(|i| format!("test-master-{i}")).collect();
    config.raft_addresses = Vec::new();
    config.tmp_path = dir.path().to_path_buf();
    config.tick_interval = Duration::from_millis(20);
    config.task_timeout = Duration::from_millis(300);
    config.heartbeat_timeout = Duration::from_millis(200);
    config.worker_timeout = Duration::from_millis(400);
    config.heartbeat_interval = Duration::from_millis(50);
    config.poll_backoff = Duration::from_millis(20);
    config.poll_backoff_max = Duration::from_millis(80);
    config.worker_prune_after = Duration::from_secs(60);
    config.validate().expect("test config must be valid");
    config
}

pub struct TestCluster {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub cluster: LocalCluster,
    pub masters: Vec<Master>,
}

impl TestCluster {
    pub async fn start(replicas: usize) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = Arc::new(test_config(&dir, replicas));
        let cluster = LocalCluster::new(config.rpc_addresses.clone());
        let masters = (0..replicas)
            .map(|i| {
                Master::new(
                    config.clone(),
                    Arc::new(cluster.node(i)),
                    cluster.state(i),
                )
            })
            .collect();
        Self {
            dir,
            config,
            cluster,
            masters,
        }
    }

    /// Routing client over every master's in-process API.
    pub fn client(&self) -> Arc<RoutingClient> {
        let endpoints = self
            .config
            .rpc_addresses
            .iter()
            .cloned()
            .zip(
                self.masters
                    .iter()
                    .map(|m| m.api() as Arc<dyn CoordinatorApi>),
            )
            .collect();
        Arc::new(RoutingClient::over(endpoints, &self.config))
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.dir.path())
    }

    pub async fn write_input(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, contents).await.expect("write input");
        path
    }

    /// Start a word-count worker; returns its shutdown switch.
    pub fn spawn_worker(&self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let worker = WorkerRuntime::new(
            self.config.clone(),
            self.client(),
            Arc::new(WordCount),
            Arc::new(WordCount),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let _ = worker.run(shutdown_rx).await;
        });
        (shutdown_tx, handle)
    }
}

/// Poll job status until it reaches `phase` or the deadline passes.
pub async fn wait_for_phase(
    client: &RoutingClient,
    phase: &str,
    deadline: Duration,
) -> JobStatusResponse {
    let started = std::time::Instant::now();
    loop {
        if let Ok(status) = client.job_status().await {
            if status.phase == phase {
                return status;
            }
            assert_ne!(
                status.phase, "failed",
                "job failed while waiting for phase {phase}"
            );
        }
        assert!(
            started.elapsed() < deadline,
            "timed out waiting for job phase {phase}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// All `key value` lines across the given partition outputs, sorted.
pub async fn collect_output_lines(layout: &StorageLayout, reduce_count: u32) -> Vec<String> {
    let mut lines = Vec::new();
    for partition in 0..reduce_count {
        let path = layout.output(partition);
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            lines.extend(contents.lines().map(|l| l.to_string()));
        }
    }
    lines.sort();
    lines
}
