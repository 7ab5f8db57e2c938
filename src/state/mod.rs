//! The replicated job state machine
//!
//! Holds the authoritative Job/Task/Worker state and applies committed
//! commands in log order on every replica. All time-dependent decisions
//! key off timestamps carried inside `Tick` commands, never off a
//! replica's own clock.

pub mod command;
pub mod machine;
pub mod snapshot;
pub mod types;

pub use command::Command;
pub use machine::{ApplyOutcome, MachineState};
pub use types::{
    Job, JobId, JobPhase, Task, TaskId, TaskKind, TaskPayload, TaskState, WorkerId, WorkerRecord,
    WorkerStatus,
};
