//! Worker runtime: task polling, execution, heartbeats
//!
//! A worker is an independent process with two threads of control: the
//! main loop polls the masters for a task and executes it, while the
//! heartbeat loop keeps the worker alive in the leader's eyes. Heartbeat
//! acks echo the leader's view of the worker's assignment; a mismatch
//! means the task was reassigned, and the in-flight execution observes the
//! cancellation flag at its next check point.

pub mod map_task;
pub mod reduce_task;

use crate::config::Config;
use crate::error::CoordinatorError;
use crate::rpc::protocol::{
    AssignmentView, HeartbeatRequest, HeartbeatResponse, ReportTaskRequest, RequestTaskRequest,
    TaskAssignment, TaskOutcome,
};
use crate::rpc::CoordinatorApi;
use crate::state::{TaskKind, WorkerId};
use crate::storage::StorageLayout;
use crate::userfns::{MapFunction, ReduceFunction};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Errors raised while executing a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The assignment was superseded; abort without reporting.
    #[error("task cancelled")]
    Cancelled,

    #[error("I/O failure at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("input file missing: {path}")]
    MissingInput { path: PathBuf },

    #[error("intermediate file corrupt at {path}: {reason}")]
    CorruptIntermediate { path: PathBuf, reason: String },

    /// User map/reduce failures and unusable assignments arrive here as
    /// [`CoordinatorError::TaskExecution`].
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl TaskError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// First line of every intermediate file: the record count.
///
/// A partition with no records still gets a header, which keeps legitimate
/// empty partitions distinguishable from zero-size corruption, and lets
/// readers detect truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateHeader {
    pub records: u64,
}

/// Stable partitioner: same key, same partition, across processes and
/// binary versions.
pub fn partition_for_key(key: &str, reduce_count: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(reduce_count.max(1))) as u32
}

struct ActiveTask {
    view: AssignmentView,
    cancel: watch::Sender<bool>,
}

type CurrentSlot = Arc<Mutex<Option<ActiveTask>>>;

/// One worker process.
pub struct WorkerRuntime {
    id: WorkerId,
    config: Arc<Config>,
    api: Arc<dyn CoordinatorApi>,
    layout: StorageLayout,
    map_fn: Arc<dyn MapFunction>,
    reduce_fn: Arc<dyn ReduceFunction>,
}

impl WorkerRuntime {
    pub fn new(
        config: Arc<Config>,
        api: Arc<dyn CoordinatorApi>,
        map_fn: Arc<dyn MapFunction>,
        reduce_fn: Arc<dyn ReduceFunction>,
    ) -> Self {
        let layout = StorageLayout::new(&config.tmp_path);
        Self {
            id: WorkerId::new(),
            config,
            api,
            layout,
            map_fn,
            reduce_fn,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Poll, execute, and report until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoordinatorError> {
        self.layout.ensure_root().await?;
        info!("Worker {} starting", self.id);

        let current: CurrentSlot = Arc::new(Mutex::new(None));
        let heartbeats = tokio::spawn(heartbeat_loop(
            self.api.clone(),
            self.id.clone(),
            current.clone(),
            self.config.heartbeat_interval,
        ));

        let mut idle_round = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let request = RequestTaskRequest {
                worker_id: self.id.to_string(),
                addr: self.id.to_string(),
            };
            match self.api.request_task(request).await {
                Err(e) => {
                    warn!("Task request failed: {}", e);
                    if sleep_or_shutdown(self.backoff(idle_round), &mut shutdown).await {
                        break;
                    }
                    idle_round += 1;
                }
                Ok(response) => match response.task {
                    None => {
                        let wait = Duration::from_millis(response.retry_after_ms.max(10));
                        if sleep_or_shutdown(jittered(wait), &mut shutdown).await {
                            break;
                        }
                    }
                    Some(assignment) => {
                        idle_round = 0;
                        self.run_assignment(assignment, &current).await;
                    }
                },
            }
        }

        heartbeats.abort();
        info!("Worker {} stopped", self.id);
        Ok(())
    }

    async fn run_assignment(&self, assignment: TaskAssignment, current: &CurrentSlot) {
        let view = AssignmentView {
            kind: assignment.kind,
            index: assignment.index,
            attempt: assignment.attempt,
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut slot = current.lock().expect("assignment slot poisoned");
            *slot = Some(ActiveTask {
                view,
                cancel: cancel_tx,
            });
        }

        info!(
            "Executing {} {} attempt {}",
            assignment.kind, assignment.index, assignment.attempt
        );
        let result = match assignment.kind {
            TaskKind::Map => {
                map_task::run(&self.layout, &assignment, self.map_fn.as_ref(), &cancel_rx).await
            }
            TaskKind::Reduce => {
                reduce_task::run(
                    &self.layout,
                    &assignment,
                    self.reduce_fn.as_ref(),
                    self.config.checkpoint_stride,
                    &cancel_rx,
                )
                .await
            }
        };
        {
            let mut slot = current.lock().expect("assignment slot poisoned");
            *slot = None;
        }

        let outcome = match result {
            Ok(()) => (TaskOutcome::Success, None),
            Err(TaskError::Cancelled) => {
                info!(
                    "Assignment {} {} attempt {} superseded; aborted",
                    assignment.kind, assignment.index, assignment.attempt
                );
                return; // nobody is waiting for this attempt anymore
            }
            Err(e) => {
                warn!(
                    "Task {} {} attempt {} failed: {}",
                    assignment.kind, assignment.index, assignment.attempt, e
                );
                (TaskOutcome::Failure, Some(e.to_string()))
            }
        };

        let report = ReportTaskRequest {
            job_id: assignment.job_id.clone(),
            worker_id: self.id.to_string(),
            kind: assignment.kind,
            index: assignment.index,
            attempt: assignment.attempt,
            outcome: outcome.0,
            error: outcome.1,
        };
        if let Err(e) = self.api.report_task(report).await {
            // The routing client already retried; a lost report is safe,
            // the leader's timeout path re-examines the evidence.
            warn!("Could not deliver completion report: {}", e);
        }
    }

    fn backoff(&self, round: u32) -> Duration {
        let base = self.config.poll_backoff.as_millis() as u64;
        let capped =
            (base << round.min(6)).min(self.config.poll_backoff_max.as_millis() as u64);
        jittered(Duration::from_millis(capped))
    }
}

fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    let jitter = rand::rng().random_range(0..=millis / 4 + 1);
    Duration::from_millis(millis + jitter)
}

/// Returns true when shutdown was requested during the wait.
async fn sleep_or_shutdown(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}

async fn heartbeat_loop(
    api: Arc<dyn CoordinatorApi>,
    worker_id: WorkerId,
    current: CurrentSlot,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let request = HeartbeatRequest {
            worker_id: worker_id.to_string(),
            addr: worker_id.to_string(),
        };
        match api.heartbeat(request).await {
            Ok(ack) => {
                if let Some(hint) = ack.leader_hint.as_deref() {
                    api.note_leader(hint);
                }
                reconcile(&current, &ack);
            }
            Err(e) => debug!("Heartbeat not delivered: {}", e),
        }
    }
}

/// Cancel the in-flight task when the leader no longer has it assigned to
/// us. Only leader-served acks count; a lagging follower's view must not
/// abort live work.
fn reconcile(current: &CurrentSlot, ack: &HeartbeatResponse) {
    if ack.leader_hint.is_some() {
        return;
    }
    let slot = current.lock().expect("assignment slot poisoned");
    if let Some(active) = slot.as_ref() {
        if ack.assignment != Some(active.view) {
            debug!(
                "Assignment {:?} superseded by leader view {:?}; cancelling",
                active.view, ack.assignment
            );
            let _ = active.cancel.send(true);
        }
    }
}
