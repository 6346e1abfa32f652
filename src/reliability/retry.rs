use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Count-bounded retry schedule with variable exponential backoff.
///
/// Attempt `n` (zero based) that fails is followed by a pause of
/// `unit * base^(n+1)`, so with the defaults the pauses are 5s, 25s, 125s.
/// Individual pauses never exceed `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: u32,
    pub unit: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: 5,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: u32) -> Self {
        Self {
            max_retries,
            base,
            ..Self::default()
        }
    }

    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Total attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .base
            .checked_pow(attempt.saturating_add(1))
            .unwrap_or(u32::MAX);
        self.unit
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Sleeps before the next attempt. Returns `false` if cancelled first.
    pub async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        let delay = self.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

/// What to do with a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    Retry,
    Fatal,
}

/// Job-control calls: any 5xx is transient.
pub fn classify_send_status(status: StatusCode) -> Disposition {
    if status.is_success() {
        Disposition::Success
    } else if status.is_server_error() {
        Disposition::Retry
    } else {
        Disposition::Fatal
    }
}

/// Ingest uploads: only 202 is success, only gateway-class 5xx are transient.
pub fn classify_ingest_status(status: StatusCode) -> Disposition {
    match status {
        StatusCode::ACCEPTED => Disposition::Success,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Disposition::Retry
        }
        _ => Disposition::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_powers_of_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(25));
        assert_eq!(policy.delay_for(2), Duration::from_secs(125));
        assert_eq!(policy.delay_for(3), Duration::from_secs(300));
    }

    #[test]
    fn huge_exponents_saturate_at_cap() {
        let policy = RetryPolicy::new(100, 10);
        assert_eq!(policy.delay_for(50), Duration::from_secs(300));
    }

    #[test]
    fn zero_base_never_waits() {
        let policy = RetryPolicy::new(3, 0);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn send_status_classification() {
        assert_eq!(classify_send_status(StatusCode::OK), Disposition::Success);
        assert_eq!(classify_send_status(StatusCode::NO_CONTENT), Disposition::Success);
        assert_eq!(
            classify_send_status(StatusCode::INTERNAL_SERVER_ERROR),
            Disposition::Retry
        );
        assert_eq!(classify_send_status(StatusCode::NOT_FOUND), Disposition::Fatal);
    }

    #[test]
    fn ingest_status_classification() {
        assert_eq!(classify_ingest_status(StatusCode::ACCEPTED), Disposition::Success);
        assert_eq!(classify_ingest_status(StatusCode::OK), Disposition::Fatal);
        assert_eq!(
            classify_ingest_status(StatusCode::GATEWAY_TIMEOUT),
            Disposition::Retry
        );
        assert_eq!(
            classify_ingest_status(StatusCode::INTERNAL_SERVER_ERROR),
            Disposition::Fatal
        );
    }

    #[tokio::test]
    async fn backoff_stops_on_cancel() {
        let policy = RetryPolicy::new(3, 5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!policy.backoff(0, &cancel).await);
    }
}
