//! HTTP/JSON transport for the coordinator API
//!
//! A thin axum layer over [`Dispatcher`]: every route deserializes the
//! request, calls the dispatcher, and wraps the outcome in an
//! [`Envelope`]. Leadership redirects travel as data, not HTTP errors, so
//! clients handle them uniformly across transports.

use super::api::CoordinatorApi;
use super::dispatch::Dispatcher;
use super::protocol::{
    Envelope, HeartbeatRequest, HeartbeatResponse, JobStatusResponse, LeaderResponse,
    ReportTaskRequest, RequestTaskRequest, RequestTaskResponse, SubmitJobRequest,
    SubmitJobResponse, WorkerCountResponse,
};
use crate::error::CoordinatorError;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::info;

fn envelope<T>(result: Result<T, CoordinatorError>) -> Json<Envelope<T>> {
    match result {
        Ok(value) => Json(Envelope::ok(value)),
        Err(err) => Json(Envelope::from_error(&err)),
    }
}

async fn submit_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<SubmitJobRequest>,
) -> Json<Envelope<SubmitJobResponse>> {
    envelope(dispatcher.submit_job(request).await)
}

async fn request_task(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<RequestTaskRequest>,
) -> Json<Envelope<RequestTaskResponse>> {
    envelope(dispatcher.request_task(request).await)
}

async fn report_task(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<ReportTaskRequest>,
) -> Json<Envelope<()>> {
    envelope(dispatcher.report_task(request).await)
}

async fn heartbeat(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<Envelope<HeartbeatResponse>> {
    envelope(dispatcher.heartbeat(request).await)
}

async fn worker_count(
    State(dispatcher): State<Arc<Dispatcher>>,
) -> Json<Envelope<WorkerCountResponse>> {
    envelope(dispatcher.worker_count().await)
}

async fn leader(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Envelope<LeaderResponse>> {
    envelope(dispatcher.leader().await)
}

async fn job_status(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Envelope<JobStatusResponse>> {
    envelope(dispatcher.job_status().await)
}

/// Build the route table for one master.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/v1/jobs", post(submit_job))
        .route("/v1/tasks/request", post(request_task))
        .route("/v1/tasks/report", post(report_task))
        .route("/v1/heartbeat", post(heartbeat))
        .route("/v1/workers", get(worker_count))
        .route("/v1/leader", get(leader))
        .route("/v1/job", get(job_status))
        .with_state(dispatcher)
}

/// Bind and serve until the process exits.
pub async fn serve(addr: &str, dispatcher: Arc<Dispatcher>) -> Result<(), CoordinatorError> {
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| CoordinatorError::Transport {
                reason: format!("cannot bind {addr}: {e}"),
            })?;
    info!("Coordinator RPC listening on {}", addr);
    axum::serve(listener, router(dispatcher))
        .await
        .map_err(|e| CoordinatorError::Transport {
            reason: format!("rpc server stopped: {e}"),
        })
}
