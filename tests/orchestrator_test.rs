use async_trait::async_trait;
use azure_graph_forwarder::buffer::BatchConfig;
use azure_graph_forwarder::collector::{Collection, Collector};
use azure_graph_forwarder::domain::{
    ClientJob, CurrentJob, JobStatus, UpdateClientRequest, UpdateClientResponse,
};
use azure_graph_forwarder::jobs::{
    JobOrchestrator, OrchestratorConfig, OrchestratorError, TickAction,
};
use azure_graph_forwarder::sender::{ClientError, ORPHANED_JOB_MESSAGE, ServiceClient};
use chrono::{Duration as ChronoDuration, Utc};
use mockall::mock;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    UpdateClient,
    AvailableJobs,
    Checkin,
    Start(i64),
    Ingest(Vec<usize>),
    End(JobStatus, String),
    CloseIdle,
}

/// In-memory service that records every call in order.
#[derive(Default)]
struct FakeService {
    calls: Mutex<Vec<Call>>,
    registration: UpdateClientResponse,
    jobs: Vec<ClientJob>,
    fail_registration: bool,
    fail_start: bool,
    ingest_errors: bool,
    hold_poll: Option<Arc<Notify>>,
    hold_ingest: Option<Arc<Notify>>,
}

impl FakeService {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ServiceClient for FakeService {
    async fn ingest(
        &self,
        _cancel: &CancellationToken,
        mut batches: mpsc::Receiver<Vec<Value>>,
    ) -> bool {
        let mut sizes = Vec::new();
        while let Some(batch) = batches.recv().await {
            sizes.push(batch.len());
        }
        if let Some(hold) = &self.hold_ingest {
            hold.notified().await;
        }
        self.record(Call::Ingest(sizes));
        self.ingest_errors
    }

    async fn get_available_jobs(&self) -> Result<Vec<ClientJob>, ClientError> {
        self.record(Call::AvailableJobs);
        if let Some(hold) = &self.hold_poll {
            hold.notified().await;
        }
        Ok(self.jobs.clone())
    }

    async fn checkin(&self) -> Result<(), ClientError> {
        self.record(Call::Checkin);
        Ok(())
    }

    async fn start_job(&self, job_id: i64) -> Result<(), ClientError> {
        self.record(Call::Start(job_id));
        if self.fail_start {
            return Err(ClientError::InvalidConfiguration("start rejected".into()));
        }
        Ok(())
    }

    async fn end_job(&self, status: JobStatus, message: &str) -> Result<(), ClientError> {
        self.record(Call::End(status, message.to_string()));
        Ok(())
    }

    async fn update_client(&self) -> Result<UpdateClientResponse, ClientError> {
        self.record(Call::UpdateClient);
        if self.fail_registration {
            return Err(ClientError::Dial(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        Ok(self.registration.clone())
    }

    fn close_idle_connections(&self) {
        self.record(Call::CloseIdle);
    }
}

/// Emits `count` records and closes.
struct FixedCollector {
    count: usize,
}

impl Collector for FixedCollector {
    fn collect(&self, _cancel: CancellationToken) -> Collection {
        let count = self.count;
        Collection::spawn(8, move |tx| async move {
            for i in 0..count {
                if tx.send(json!({"id": i})).await.is_err() {
                    return;
                }
            }
        })
    }
}

/// Emits one record, then its producer task panics.
struct TruncatingCollector;

impl Collector for TruncatingCollector {
    fn collect(&self, _cancel: CancellationToken) -> Collection {
        Collection::spawn(8, |tx| async move {
            if tx.send(json!({"id": 1})).await.is_ok() {
                panic!("enumeration failed mid-stream");
            }
        })
    }
}

mock! {
    PanickingCollector {}
    impl Collector for PanickingCollector {
        fn collect(&self, cancel: CancellationToken) -> Collection;
    }
}

fn ready_job(id: i64, minutes_ago: i64) -> ClientJob {
    serde_json::from_value(json!({
        "id": id,
        "status": 0,
        "execution_time": (Utc::now() - ChronoDuration::minutes(minutes_ago)).to_rfc3339(),
    }))
    .unwrap()
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(20),
        batch: BatchConfig {
            max_size: 2,
            flush_timeout: Duration::from_secs(5),
        },
        shutdown_grace: Duration::from_secs(2),
    }
}

fn orchestrator(service: Arc<FakeService>, collector: Arc<dyn Collector>) -> JobOrchestrator {
    JobOrchestrator::new(service, collector, config())
}

async fn wait_for_current_job(orchestrator: &JobOrchestrator) -> i64 {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(id) = orchestrator.current_job() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn orphaned_job_is_failed_before_any_poll() {
    let service = Arc::new(FakeService {
        registration: UpdateClientResponse {
            current_job: CurrentJob {
                id: 77,
                status: JobStatus::Running,
            },
            ..UpdateClientResponse::default()
        },
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 0 }));

    orchestrator.register().await.unwrap();
    assert_eq!(orchestrator.tick(&CancellationToken::new()).await, TickAction::PollStarted);
    orchestrator.wait_idle().await;

    assert_eq!(
        service.calls(),
        vec![
            Call::UpdateClient,
            Call::End(JobStatus::Failed, ORPHANED_JOB_MESSAGE.to_string()),
            Call::AvailableJobs,
        ]
    );
}

#[tokio::test]
async fn ready_job_runs_through_full_lifecycle() {
    let service = Arc::new(FakeService {
        jobs: vec![ready_job(3, 1), ready_job(7, 10)],
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 5 }));

    orchestrator.tick(&CancellationToken::new()).await;
    orchestrator.wait_idle().await;

    assert_eq!(
        service.calls(),
        vec![
            Call::AvailableJobs,
            Call::Start(7),
            Call::Ingest(vec![2, 2, 1]),
            Call::End(JobStatus::Complete, "Collection completed successfully".into()),
            Call::CloseIdle,
        ]
    );
    assert_eq!(orchestrator.current_job(), None);
}

#[tokio::test]
async fn ingest_errors_complete_job_with_error_message() {
    let service = Arc::new(FakeService {
        jobs: vec![ready_job(1, 1)],
        ingest_errors: true,
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 1 }));

    orchestrator.tick(&CancellationToken::new()).await;
    orchestrator.wait_idle().await;

    assert!(service.calls().contains(&Call::End(
        JobStatus::Complete,
        "Collection completed with errors during ingest".into()
    )));
}

#[tokio::test]
async fn heartbeat_is_sent_while_job_runs() {
    let release = Arc::new(Notify::new());
    let service = Arc::new(FakeService {
        jobs: vec![ready_job(12, 1)],
        hold_ingest: Some(release.clone()),
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 1 }));
    let cancel = CancellationToken::new();

    assert_eq!(orchestrator.tick(&cancel).await, TickAction::PollStarted);
    assert_eq!(wait_for_current_job(&orchestrator).await, 12);
    assert_eq!(orchestrator.tick(&cancel).await, TickAction::Heartbeat(12));

    release.notify_one();
    orchestrator.wait_idle().await;

    let calls = service.calls();
    assert!(calls.contains(&Call::Checkin));
    assert_eq!(orchestrator.current_job(), None);
}

#[tokio::test]
async fn overlapping_tick_skips_poll() {
    let release = Arc::new(Notify::new());
    let service = Arc::new(FakeService {
        hold_poll: Some(release.clone()),
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 0 }));
    let cancel = CancellationToken::new();

    assert_eq!(orchestrator.tick(&cancel).await, TickAction::PollStarted);
    assert_eq!(orchestrator.tick(&cancel).await, TickAction::PollInProgress);

    release.notify_one();
    orchestrator.wait_idle().await;
    assert_eq!(service.calls(), vec![Call::AvailableJobs]);
}

#[tokio::test]
async fn failed_start_leaves_job_for_next_poll() {
    let service = Arc::new(FakeService {
        jobs: vec![ready_job(4, 1)],
        fail_start: true,
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 3 }));

    orchestrator.tick(&CancellationToken::new()).await;
    orchestrator.wait_idle().await;

    assert_eq!(service.calls(), vec![Call::AvailableJobs, Call::Start(4)]);
    assert_eq!(orchestrator.current_job(), None);
}

#[tokio::test]
async fn future_jobs_are_not_started() {
    let mut job = ready_job(8, 0);
    job.execution_time = Utc::now() + ChronoDuration::hours(1);
    let service = Arc::new(FakeService {
        jobs: vec![job],
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 1 }));

    orchestrator.tick(&CancellationToken::new()).await;
    orchestrator.wait_idle().await;

    assert_eq!(service.calls(), vec![Call::AvailableJobs]);
}

#[tokio::test]
async fn collector_panic_fails_the_job() {
    let service = Arc::new(FakeService {
        jobs: vec![ready_job(21, 1)],
        ..FakeService::default()
    });
    let mut collector = MockPanickingCollector::new();
    collector
        .expect_collect()
        .times(1)
        .returning(|_| panic!("enumeration blew up"));
    let orchestrator = orchestrator(service.clone(), Arc::new(collector));

    orchestrator.tick(&CancellationToken::new()).await;
    orchestrator.wait_idle().await;

    let calls = service.calls();
    assert!(calls.iter().any(|call| matches!(call, Call::End(JobStatus::Failed, _))));
    assert_eq!(orchestrator.current_job(), None);
}

#[tokio::test]
async fn producer_panic_mid_stream_fails_the_job() {
    let service = Arc::new(FakeService {
        jobs: vec![ready_job(22, 1)],
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(TruncatingCollector));

    orchestrator.tick(&CancellationToken::new()).await;
    orchestrator.wait_idle().await;

    let calls = service.calls();
    assert!(
        calls.contains(&Call::End(
            JobStatus::Failed,
            "Collection aborted due to an internal error".into()
        )),
        "unexpected calls: {calls:?}"
    );
    assert!(!calls.iter().any(|call| matches!(call, Call::End(JobStatus::Complete, _))));
    assert_eq!(orchestrator.current_job(), None);
}

#[tokio::test]
async fn registration_failure_stops_run() {
    let service = Arc::new(FakeService {
        fail_registration: true,
        ..FakeService::default()
    });
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 0 }));

    let result = orchestrator.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(OrchestratorError::Registration(_))));
    assert_eq!(service.calls(), vec![Call::UpdateClient]);
}

#[tokio::test]
async fn run_polls_until_cancelled() {
    let service = Arc::new(FakeService::default());
    let orchestrator = orchestrator(service.clone(), Arc::new(FixedCollector { count: 0 }));
    let cancel = CancellationToken::new();

    let runner = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(3), runner)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    let polls = service
        .calls()
        .iter()
        .filter(|call| **call == Call::AvailableJobs)
        .count();
    assert!(polls >= 2, "expected repeated polling, saw {polls}");
}

#[test]
fn registration_payload_serializes_flat() {
    let body = UpdateClientRequest {
        address: "10.0.0.4".into(),
        hostname: "collector-01".into(),
        version: "1.0.0".into(),
    };
    assert_eq!(
        serde_json::to_value(body).unwrap(),
        json!({"address": "10.0.0.4", "hostname": "collector-01", "version": "1.0.0"})
    );
}
