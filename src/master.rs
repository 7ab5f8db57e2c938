//! Master node composition
//!
//! Wires one replica's pieces together: the replicated log node, the
//! shared state handle, the scheduler loop, and the request dispatcher.
//! Control flows one way with no back-edges: RPC handlers hold the
//! dispatcher, the dispatcher holds the scheduler handle, and the
//! scheduler holds the state machine.

use crate::config::Config;
use crate::consensus::ReplicatedLog;
use crate::error::CoordinatorError;
use crate::rpc::{server, Dispatcher};
use crate::scheduler;
use crate::state::MachineState;
use crate::storage::StorageLayout;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One running master.
pub struct Master {
    dispatcher: Arc<Dispatcher>,
    scheduler_task: JoinHandle<()>,
}

impl Master {
    /// Assemble a master around a consensus node and its replica state,
    /// and start its scheduler loop.
    pub fn new(
        config: Arc<Config>,
        log: Arc<dyn ReplicatedLog>,
        state: Arc<RwLock<MachineState>>,
    ) -> Self {
        let layout = StorageLayout::new(&config.tmp_path);
        let (handle, scheduler_loop) =
            scheduler::channel(config, log.clone(), state.clone(), layout);
        let scheduler_task = tokio::spawn(scheduler_loop.run());
        let dispatcher = Arc::new(Dispatcher::new(handle, state, log));
        Self {
            dispatcher,
            scheduler_task,
        }
    }

    /// The in-process API surface; also what the HTTP transport wraps.
    pub fn api(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Serve the HTTP transport on `addr` until the process exits.
    pub async fn serve(&self, addr: &str) -> Result<(), CoordinatorError> {
        server::serve(addr, self.dispatcher.clone()).await
    }

    /// Stop the scheduler loop.
    pub fn shutdown(&self) {
        self.scheduler_task.abort();
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.scheduler_task.abort();
    }
}
