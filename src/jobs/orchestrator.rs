use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::selection::select_next_job;
use crate::buffer::{BatchConfig, batch};
use crate::collector::Collector;
use crate::domain::{JobStatus, UpdateClientResponse};
use crate::sender::{ClientError, ServiceClient};

pub const COMPLETED_MESSAGE: &str = "Collection completed successfully";
pub const COMPLETED_WITH_ERRORS_MESSAGE: &str = "Collection completed with errors during ingest";
pub const INTERRUPTED_MESSAGE: &str = "Collection interrupted by agent shutdown";
pub const PANICKED_MESSAGE: &str = "Collection aborted due to an internal error";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("failed to update client: {0}")]
    Registration(#[source] ClientError),
    #[error("failed to end orphaned job: {0}")]
    OrphanRecovery(#[source] ClientError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub batch: BatchConfig,
    /// How long shutdown waits for an active job to report its end.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch: BatchConfig::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// What a single tick of the control loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Heartbeat(i64),
    PollStarted,
    PollInProgress,
}

#[derive(Debug)]
enum JobOutcome {
    Completed { had_errors: bool },
    Interrupted,
    Panicked,
}

impl JobOutcome {
    fn report(&self) -> (JobStatus, &'static str) {
        match self {
            JobOutcome::Completed { had_errors: false } => (JobStatus::Complete, COMPLETED_MESSAGE),
            JobOutcome::Completed { had_errors: true } => {
                (JobStatus::Complete, COMPLETED_WITH_ERRORS_MESSAGE)
            }
            JobOutcome::Interrupted => (JobStatus::Failed, INTERRUPTED_MESSAGE),
            JobOutcome::Panicked => (JobStatus::Failed, PANICKED_MESSAGE),
        }
    }
}

/// Clears the current job id however the job task exits.
struct CurrentJobGuard<'a> {
    slot: &'a AtomicI64,
}

impl<'a> CurrentJobGuard<'a> {
    fn set(slot: &'a AtomicI64, job_id: i64) -> Self {
        slot.store(job_id, Ordering::SeqCst);
        Self { slot }
    }
}

impl Drop for CurrentJobGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(0, Ordering::SeqCst);
    }
}

/// Drives the poll, start, collect, ingest and end cycle for one job at a time.
#[derive(Clone)]
pub struct JobOrchestrator {
    client: Arc<dyn ServiceClient>,
    collector: Arc<dyn Collector>,
    config: OrchestratorConfig,
    current_job: Arc<AtomicI64>,
    poll_lock: Arc<Mutex<()>>,
}

impl JobOrchestrator {
    pub fn new(
        client: Arc<dyn ServiceClient>,
        collector: Arc<dyn Collector>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            collector,
            config,
            current_job: Arc::new(AtomicI64::new(0)),
            poll_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn current_job(&self) -> Option<i64> {
        match self.current_job.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Registers with the service and fails any job a previous run left behind.
    pub async fn register(&self) -> Result<UpdateClientResponse, OrchestratorError> {
        let registration = self
            .client
            .update_client()
            .await
            .map_err(OrchestratorError::Registration)?;
        self.client
            .end_orphaned_job(&registration)
            .await
            .map_err(OrchestratorError::OrphanRecovery)?;
        Ok(registration)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        self.register().await?;
        info!("Connected successfully, waiting for jobs");

        let period = self.config.poll_interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        _ = self.tick(&cancel) => {}
                    }
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// One control-loop step: heartbeat a running job or start a poll.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickAction {
        if let Some(job_id) = self.current_job() {
            debug!(job_id, "Collection in progress");
            if let Err(e) = self.client.checkin().await {
                error!(error = %e, job_id, "Service checkin failed");
            }
            return TickAction::Heartbeat(job_id);
        }

        let Ok(guard) = self.poll_lock.clone().try_lock_owned() else {
            return TickAction::PollInProgress;
        };

        let this = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.poll_and_run(&cancel).await;
        });
        TickAction::PollStarted
    }

    /// Waits until no poll or job task holds the lock.
    pub async fn wait_idle(&self) {
        let _guard = self.poll_lock.lock().await;
    }

    async fn drain(&self) {
        if tokio::time::timeout(self.config.shutdown_grace, self.wait_idle())
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                job_id = self.current_job(),
                "Active job did not finish before shutdown"
            );
        }
    }

    async fn poll_and_run(&self, cancel: &CancellationToken) {
        debug!("Checking for available collection jobs");
        let jobs = match self.client.get_available_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Unable to fetch available jobs");
                return;
            }
        };

        let Some(job) = select_next_job(&jobs, Utc::now()) else {
            debug!(available = jobs.len(), "No jobs ready at this time");
            return;
        };
        let job_id = job.id;
        let _current = CurrentJobGuard::set(&self.current_job, job_id);

        if let Err(e) = self.client.start_job(job_id).await {
            error!(error = %e, job_id, "Failed to start job, will retry on next heartbeat");
            return;
        }

        let started = Instant::now();
        let outcome = self.collect_and_ingest(cancel).await;
        let (status, message) = outcome.report();

        match self.client.end_job(status, message).await {
            Ok(()) => info!(
                job_id,
                status = %status,
                duration_secs = started.elapsed().as_secs(),
                "{message}"
            ),
            Err(e) => error!(error = %e, job_id, "Failed to end job"),
        }

        self.client.close_idle_connections();
    }

    /// Runs the collector, batcher and ingest stages as separate tasks.
    ///
    /// A closed channel downstream of a panicked stage looks like a normal end
    /// of stream, so every stage is joined and any failure fails the job.
    async fn collect_and_ingest(&self, cancel: &CancellationToken) -> JobOutcome {
        let job_cancel = cancel.child_token();

        // `collect` can panic before any stream exists.
        let collector = self.collector.clone();
        let collect_cancel = job_cancel.clone();
        let collection =
            match tokio::spawn(async move { collector.collect(collect_cancel) }).await {
                Ok(collection) => collection,
                Err(e) => {
                    error!(stage = "collector", error = %e, "Collection stage failed");
                    return if e.is_panic() {
                        JobOutcome::Panicked
                    } else {
                        JobOutcome::Interrupted
                    };
                }
            };

        let (batches, batcher) = batch(job_cancel.clone(), collection.records, self.config.batch);
        let client = self.client.clone();
        let ingest_cancel = job_cancel.clone();
        let ingest = tokio::spawn(async move { client.ingest(&ingest_cancel, batches).await });

        let (producer, batcher, ingest) = tokio::join!(
            supervise("collector", collection.producer, &job_cancel),
            supervise("batcher", batcher, &job_cancel),
            supervise("ingest", ingest, &job_cancel),
        );

        let panicked = [producer.as_ref().err(), batcher.as_ref().err(), ingest.as_ref().err()]
            .into_iter()
            .flatten()
            .any(JoinError::is_panic);
        if panicked {
            return JobOutcome::Panicked;
        }

        match ingest {
            Ok(_) if cancel.is_cancelled() => JobOutcome::Interrupted,
            Ok(had_errors) if producer.is_ok() && batcher.is_ok() => {
                JobOutcome::Completed { had_errors }
            }
            _ => JobOutcome::Interrupted,
        }
    }
}

/// Awaits one pipeline stage, cancelling the rest of the job if it failed.
async fn supervise<T>(
    stage: &'static str,
    handle: JoinHandle<T>,
    job_cancel: &CancellationToken,
) -> Result<T, JoinError> {
    let result = handle.await;
    if let Err(e) = &result {
        error!(stage, error = %e, "Collection stage failed, cancelling job");
        job_cancel.cancel();
    }
    result
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .field("current_job", &self.current_job())
            .finish_non_exhaustive()
    }
}
