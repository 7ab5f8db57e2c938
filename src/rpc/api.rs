//! Transport-neutral coordinator API
//!
//! Workers and clients speak this trait; the HTTP client implements it
//! over the wire, and [`crate::rpc::Dispatcher`] implements it in-process
//! so tests and embedded workers skip the transport entirely.

use super::protocol::{
    HeartbeatRequest, HeartbeatResponse, JobStatusResponse, LeaderResponse, ReportTaskRequest,
    RequestTaskRequest, RequestTaskResponse, SubmitJobRequest, SubmitJobResponse,
    WorkerCountResponse,
};
use crate::error::CoordinatorError;
use async_trait::async_trait;

/// The operations every master serves.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn submit_job(
        &self,
        request: SubmitJobRequest,
    ) -> Result<SubmitJobResponse, CoordinatorError>;

    async fn request_task(
        &self,
        request: RequestTaskRequest,
    ) -> Result<RequestTaskResponse, CoordinatorError>;

    async fn report_task(&self, request: ReportTaskRequest) -> Result<(), CoordinatorError>;

    async fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, CoordinatorError>;

    async fn worker_count(&self) -> Result<WorkerCountResponse, CoordinatorError>;

    async fn leader(&self) -> Result<LeaderResponse, CoordinatorError>;

    async fn job_status(&self) -> Result<JobStatusResponse, CoordinatorError>;

    /// Out-of-band leadership hint (e.g. from a heartbeat ack). Routing
    /// implementations retarget; single-endpoint implementations ignore it.
    fn note_leader(&self, _hint: &str) {}
}
