use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// Registration payload reported on every process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClientRequest {
    pub address: String,
    pub hostname: String,
    pub version: String,
}

/// Job the service believes this client is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentJob {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub status: JobStatus,
}

/// Service view of this client, returned from registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClientResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub current_job_id: Option<i64>,
    #[serde(default)]
    pub current_job: CurrentJob,
}

impl UpdateClientResponse {
    /// A job left `Running` by a previous process instance.
    pub fn orphaned_job(&self) -> Option<i64> {
        (self.current_job.status == JobStatus::Running).then_some(self.current_job.id)
    }
}
