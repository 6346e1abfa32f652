use chrono::{DateTime, Utc};

use crate::domain::ClientJob;

/// Earliest ready job whose execution time has been reached.
pub fn select_next_job(jobs: &[ClientJob], now: DateTime<Utc>) -> Option<&ClientJob> {
    jobs.iter()
        .filter(|job| job.is_ready_at(now))
        .min_by_key(|job| job.execution_time)
}
