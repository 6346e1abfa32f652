pub mod retry;

pub use retry::{Disposition, RetryPolicy, classify_ingest_status, classify_send_status};
