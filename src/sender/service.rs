use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::{ClientError, DeliveryClient};
use super::dial;
use crate::domain::{
    ClientJob, CompleteJobRequest, JobStatus, StartJobRequest, UpdateClientRequest,
    UpdateClientResponse,
};

pub const ORPHANED_JOB_MESSAGE: &str =
    "This job has been orphaned. Re-run collection for complete data.";

const JOBS_AVAILABLE_PATH: &str = "/api/v2/jobs/available";
const JOBS_CURRENT_PATH: &str = "/api/v2/jobs/current";
const JOBS_START_PATH: &str = "/api/v2/jobs/start";
const JOBS_END_PATH: &str = "/api/v2/jobs/end";
const CLIENT_UPDATE_PATH: &str = "/api/v2/clients/update";

/// Operations the job orchestrator needs from the graph service.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Uploads batches until the channel closes; `true` if any failed.
    async fn ingest(
        &self,
        cancel: &CancellationToken,
        batches: mpsc::Receiver<Vec<Value>>,
    ) -> bool;

    async fn get_available_jobs(&self) -> Result<Vec<ClientJob>, ClientError>;

    /// Heartbeat for the job currently in progress.
    async fn checkin(&self) -> Result<(), ClientError>;

    async fn start_job(&self, job_id: i64) -> Result<(), ClientError>;

    async fn end_job(&self, status: JobStatus, message: &str) -> Result<(), ClientError>;

    async fn update_client(&self) -> Result<UpdateClientResponse, ClientError>;

    /// Fails a job a previous process left running. Returns whether one was ended.
    async fn end_orphaned_job(
        &self,
        registration: &UpdateClientResponse,
    ) -> Result<bool, ClientError> {
        let Some(job_id) = registration.orphaned_job() else {
            return Ok(false);
        };
        info!(job_id, "Ending orphaned job");
        self.end_job(JobStatus::Failed, ORPHANED_JOB_MESSAGE).await?;
        Ok(true)
    }

    fn close_idle_connections(&self) {}
}

#[async_trait]
impl ServiceClient for DeliveryClient {
    async fn ingest(
        &self,
        cancel: &CancellationToken,
        batches: mpsc::Receiver<Vec<Value>>,
    ) -> bool {
        DeliveryClient::ingest(self, cancel, batches).await
    }

    async fn get_available_jobs(&self) -> Result<Vec<ClientJob>, ClientError> {
        self.request_json(Method::GET, JOBS_AVAILABLE_PATH, None::<&()>)
            .await
    }

    async fn checkin(&self) -> Result<(), ClientError> {
        self.request_empty(Method::GET, JOBS_CURRENT_PATH, None::<&()>)
            .await
    }

    async fn start_job(&self, job_id: i64) -> Result<(), ClientError> {
        info!(job_id, "Beginning collection job");
        self.request_empty(
            Method::POST,
            JOBS_START_PATH,
            Some(&StartJobRequest { id: job_id }),
        )
        .await
    }

    async fn end_job(&self, status: JobStatus, message: &str) -> Result<(), ClientError> {
        let body = CompleteJobRequest::new(status, message);
        info!(status = %status, message, "Ending collection job");
        self.request_empty(Method::POST, JOBS_END_PATH, Some(&body))
            .await
    }

    async fn update_client(&self) -> Result<UpdateClientResponse, ClientError> {
        let address = dial::local_address(self.base_url(), self.proxy())
            .await
            .map_err(ClientError::Dial)?;
        // Best effort; the service accepts an empty hostname.
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_default();

        let body = UpdateClientRequest {
            address: address.to_string(),
            hostname,
            version: crate::VERSION.to_string(),
        };
        debug!(?body, "Updating client info");

        self.request_json(Method::PUT, CLIENT_UPDATE_PATH, Some(&body))
            .await
    }

    fn close_idle_connections(&self) {
        if let Err(e) = self.connections().rotate() {
            tracing::warn!(error = %e, "Failed to close idle connections");
        }
    }
}
