pub mod client;
pub mod ingest;
pub mod job;

pub use client::{CurrentJob, UpdateClientRequest, UpdateClientResponse};
pub use ingest::{Envelope, IngestBatch, IngestMeta};
pub use job::{ClientJob, CompleteJobRequest, JobStatus, StartJobRequest};
