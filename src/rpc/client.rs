//! Master-iterating RPC client
//!
//! [`HttpMaster`] talks to one endpoint; [`RoutingClient`] wraps the full
//! master set and handles the failure taxonomy: leadership redirects
//! follow the hint, transient transport errors rotate to the next master
//! with jittered exponential backoff, and everything else surfaces to the
//! caller. Repeated redirects inside one call are treated as an election
//! in progress and absorbed by the same backoff.

use super::api::CoordinatorApi;
use super::protocol::{
    Envelope, HeartbeatRequest, HeartbeatResponse, JobStatusResponse, LeaderResponse,
    ReportTaskRequest, RequestTaskRequest, RequestTaskResponse, SubmitJobRequest,
    SubmitJobResponse, WorkerCountResponse,
};
use crate::config::Config;
use crate::error::CoordinatorError;
use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Client for a single master endpoint.
pub struct HttpMaster {
    base: String,
    http: reqwest::Client,
}

impl HttpMaster {
    pub fn new(addr: &str) -> Self {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, CoordinatorError> {
        let envelope: Envelope<Resp> = self
            .http
            .post(format!("{}{path}", self.base))
            .json(request)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        envelope.into_result()
    }

    async fn get<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp, CoordinatorError> {
        let envelope: Envelope<Resp> = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        envelope.into_result()
    }
}

fn transport(err: reqwest::Error) -> CoordinatorError {
    CoordinatorError::Transport {
        reason: err.to_string(),
    }
}

#[async_trait]
impl CoordinatorApi for HttpMaster {
    async fn submit_job(
        &self,
        request: SubmitJobRequest,
    ) -> Result<SubmitJobResponse, CoordinatorError> {
        self.post("/v1/jobs", &request).await
    }

    async fn request_task(
        &self,
        request: RequestTaskRequest,
    ) -> Result<RequestTaskResponse, CoordinatorError> {
        self.post("/v1/tasks/request", &request).await
    }

    async fn report_task(&self, request: ReportTaskRequest) -> Result<(), CoordinatorError> {
        self.post("/v1/tasks/report", &request).await
    }

    async fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, CoordinatorError> {
        self.post("/v1/heartbeat", &request).await
    }

    async fn worker_count(&self) -> Result<WorkerCountResponse, CoordinatorError> {
        self.get("/v1/workers").await
    }

    async fn leader(&self) -> Result<LeaderResponse, CoordinatorError> {
        self.get("/v1/leader").await
    }

    async fn job_status(&self) -> Result<JobStatusResponse, CoordinatorError> {
        self.get("/v1/job").await
    }
}

type OpFuture<T> = Pin<Box<dyn Future<Output = Result<T, CoordinatorError>> + Send>>;

/// Client over the whole master set with leader retargeting.
pub struct RoutingClient {
    masters: Vec<(String, Arc<dyn CoordinatorApi>)>,
    current: Mutex<usize>,
    poll_backoff: Duration,
    poll_backoff_max: Duration,
    max_attempts: usize,
}

impl RoutingClient {
    /// HTTP client over the configured master addresses.
    pub fn over_http(config: &Config) -> Self {
        let masters = config
            .rpc_addresses
            .iter()
            .map(|addr| {
                (
                    addr.clone(),
                    Arc::new(HttpMaster::new(addr)) as Arc<dyn CoordinatorApi>,
                )
            })
            .collect();
        Self::over(masters, config)
    }

    /// Arbitrary endpoints, labeled by address. Lets tests route to
    /// in-process dispatchers through the same failover logic.
    pub fn over(masters: Vec<(String, Arc<dyn CoordinatorApi>)>, config: &Config) -> Self {
        assert!(!masters.is_empty(), "at least one master is required");
        let max_attempts = masters.len().max(1) * 4;
        Self {
            masters,
            current: Mutex::new(0),
            poll_backoff: config.poll_backoff,
            poll_backoff_max: config.poll_backoff_max,
            max_attempts,
        }
    }

    fn current_master(&self) -> (String, Arc<dyn CoordinatorApi>) {
        let index = *self.current.lock().expect("client lock poisoned");
        let (addr, api) = &self.masters[index];
        (addr.clone(), api.clone())
    }

    fn retarget(&self, hint: Option<&str>) {
        let mut current = self.current.lock().expect("client lock poisoned");
        match hint.and_then(|h| self.masters.iter().position(|(addr, _)| addr == h)) {
            Some(index) => *current = index,
            None => *current = (*current + 1) % self.masters.len(),
        }
    }

    fn backoff(&self, round: u32) -> Duration {
        let base = self.poll_backoff.as_millis() as u64;
        let capped = (base << round.min(6)).min(self.poll_backoff_max.as_millis() as u64);
        let jitter = rand::rng().random_range(0..=capped / 2 + 1);
        Duration::from_millis(capped + jitter)
    }

    async fn with_failover<T, F>(&self, mut op: F) -> Result<T, CoordinatorError>
    where
        F: FnMut(Arc<dyn CoordinatorApi>) -> OpFuture<T>,
    {
        let mut round = 0u32;
        let mut last_err = CoordinatorError::Transport {
            reason: "no masters attempted".to_string(),
        };
        for _ in 0..self.max_attempts {
            let (addr, api) = self.current_master();
            match op(api).await {
                Ok(value) => return Ok(value),
                Err(CoordinatorError::NotLeader { hint }) => {
                    debug!(
                        "Master {} is not the leader (hint: {:?}); retargeting",
                        addr, hint
                    );
                    self.retarget(hint.as_deref());
                    // A hintless redirect means an election is in progress.
                    if hint.is_none() {
                        tokio::time::sleep(self.backoff(round)).await;
                        round += 1;
                    }
                    last_err = CoordinatorError::NotLeader { hint };
                }
                Err(err) if err.is_retryable() => {
                    debug!("Master {} unreachable ({}); rotating", addr, err);
                    self.retarget(None);
                    tokio::time::sleep(self.backoff(round)).await;
                    round += 1;
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl CoordinatorApi for RoutingClient {
    async fn submit_job(
        &self,
        request: SubmitJobRequest,
    ) -> Result<SubmitJobResponse, CoordinatorError> {
        self.with_failover(|api| {
            let request = request.clone();
            Box::pin(async move { api.submit_job(request).await })
        })
        .await
    }

    async fn request_task(
        &self,
        request: RequestTaskRequest,
    ) -> Result<RequestTaskResponse, CoordinatorError> {
        self.with_failover(|api| {
            let request = request.clone();
            Box::pin(async move { api.request_task(request).await })
        })
        .await
    }

    async fn report_task(&self, request: ReportTaskRequest) -> Result<(), CoordinatorError> {
        self.with_failover(|api| {
            let request = request.clone();
            Box::pin(async move { api.report_task(request).await })
        })
        .await
    }

    async fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, CoordinatorError> {
        self.with_failover(|api| {
            let request = request.clone();
            Box::pin(async move { api.heartbeat(request).await })
        })
        .await
    }

    async fn worker_count(&self) -> Result<WorkerCountResponse, CoordinatorError> {
        self.with_failover(|api| Box::pin(async move { api.worker_count().await }))
            .await
    }

    async fn leader(&self) -> Result<LeaderResponse, CoordinatorError> {
        self.with_failover(|api| Box::pin(async move { api.leader().await }))
            .await
    }

    async fn job_status(&self) -> Result<JobStatusResponse, CoordinatorError> {
        self.with_failover(|api| Box::pin(async move { api.job_status().await }))
            .await
    }

    fn note_leader(&self, hint: &str) {
        self.retarget(Some(hint));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedMaster {
        is_leader: bool,
        hint: Option<String>,
    }

    #[async_trait]
    impl CoordinatorApi for ScriptedMaster {
        async fn submit_job(
            &self,
            _request: SubmitJobRequest,
        ) -> Result<SubmitJobResponse, CoordinatorError> {
            unimplemented!()
        }

        async fn request_task(
            &self,
            _request: RequestTaskRequest,
        ) -> Result<RequestTaskResponse, CoordinatorError> {
            unimplemented!()
        }

        async fn report_task(&self, _request: ReportTaskRequest) -> Result<(), CoordinatorError> {
            unimplemented!()
        }

        async fn heartbeat(
            &self,
            _request: HeartbeatRequest,
        ) -> Result<HeartbeatResponse, CoordinatorError> {
            unimplemented!()
        }

        async fn worker_count(&self) -> Result<WorkerCountResponse, CoordinatorError> {
            if self.is_leader {
                Ok(WorkerCountResponse {
                    active: 1,
                    total: 1,
                })
            } else {
                Err(CoordinatorError::NotLeader {
                    hint: self.hint.clone(),
                })
            }
        }

        async fn leader(&self) -> Result<LeaderResponse, CoordinatorError> {
            unimplemented!()
        }

        async fn job_status(&self) -> Result<JobStatusResponse, CoordinatorError> {
            unimplemented!()
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.poll_backoff = Duration::from_millis(1);
        config.poll_backoff_max = Duration::from_millis(5);
        config
    }

    #[tokio::test]
    async fn test_follows_leader_hint() {
        let follower = Arc::new(ScriptedMaster {
            is_leader: false,
            hint: Some("m1".to_string()),
        }) as Arc<dyn CoordinatorApi>;
        let leader = Arc::new(ScriptedMaster {
            is_leader: true,
            hint: None,
        }) as Arc<dyn CoordinatorApi>;

        let client = RoutingClient::over(
            vec![("m0".to_string(), follower), ("m1".to_string(), leader)],
            &config(),
        );
        let response = client.worker_count().await.unwrap();
        assert_eq!(response.total, 1);
    }

    #[tokio::test]
    async fn test_rotates_without_hint() {
        let follower = Arc::new(ScriptedMaster {
            is_leader: false,
            hint: None,
        }) as Arc<dyn CoordinatorApi>;
        let leader = Arc::new(ScriptedMaster {
            is_leader: true,
            hint: None,
        }) as Arc<dyn CoordinatorApi>;

        let client = RoutingClient::over(
            vec![("m0".to_string(), follower), ("m1".to_string(), leader)],
            &config(),
        );
        let response = client.worker_count().await.unwrap();
        assert_eq!(response.total, 1);
    }

    #[tokio::test]
    async fn test_gives_up_when_no_leader_emerges() {
        let follower = Arc::new(ScriptedMaster {
            is_leader: false,
            hint: None,
        }) as Arc<dyn CoordinatorApi>;
        let client = RoutingClient::over(vec![("m0".to_string(), follower)], &config());
        let err = client.worker_count().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_note_leader_switches_target() {
        let follower = Arc::new(ScriptedMaster {
            is_leader: false,
            hint: None,
        }) as Arc<dyn CoordinatorApi>;
        let leader = Arc::new(ScriptedMaster {
            is_leader: true,
            hint: None,
        }) as Arc<dyn CoordinatorApi>;
        let client = RoutingClient::over(
            vec![("m0".to_string(), follower), ("m1".to_string(), leader)],
            &config(),
        );
        client.note_leader("m1");
        // The first attempt now goes straight to the leader.
        let response = client.worker_count().await.unwrap();
        assert_eq!(response.total, 1);
    }
}
