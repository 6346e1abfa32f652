use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a collection job as the service reports it.
///
/// Integers on the wire; upper-case names when ending a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum JobStatus {
    #[default]
    Invalid,
    Ready,
    Running,
    Complete,
    Canceled,
    TimedOut,
    Failed,
    Ingesting,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Invalid => "INVALIDSTATUS",
            JobStatus::Ready => "READY",
            JobStatus::Running => "RUNNING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Canceled => "CANCELED",
            JobStatus::TimedOut => "TIMEDOUT",
            JobStatus::Failed => "FAILED",
            JobStatus::Ingesting => "INGESTING",
        }
    }
}

impl From<i32> for JobStatus {
    fn from(value: i32) -> Self {
        match value {
            0 => JobStatus::Ready,
            1 => JobStatus::Running,
            2 => JobStatus::Complete,
            3 => JobStatus::Canceled,
            4 => JobStatus::TimedOut,
            5 => JobStatus::Failed,
            6 => JobStatus::Ingesting,
            _ => JobStatus::Invalid,
        }
    }
}

impl From<JobStatus> for i32 {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Invalid => -1,
            JobStatus::Ready => 0,
            JobStatus::Running => 1,
            JobStatus::Complete => 2,
            JobStatus::Canceled => 3,
            JobStatus::TimedOut => 4,
            JobStatus::Failed => 5,
            JobStatus::Ingesting => 6,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of collection work scheduled by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientJob {
    pub id: i64,
    pub status: JobStatus,
    pub execution_time: DateTime<Utc>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub event_id: Option<i64>,
    #[serde(default)]
    pub last_ingest: Option<DateTime<Utc>>,
    #[serde(default)]
    pub domain_controller: Option<String>,
}

impl ClientJob {
    /// True when the job may be started at `now`.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Ready && self.execution_time <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteJobRequest {
    pub status: String,
    pub message: String,
}

impl CompleteJobRequest {
    pub fn new(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status: status.as_str().to_string(),
            message: message.into(),
        }
    }
}
