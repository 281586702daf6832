//! End-to-end tests over a real gRPC server

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use coordinator::proto::{
    coordinator_message, worker_message, CoordinatorMessage, Crash, Hello, JobAssignment,
    JobResult, LostReport, StatusRequest, SubmitRequest, WorkerMessage,
};
use coordinator::{FarmClient, FarmServer, FarmService, ServerConfig};
use farm_core::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, Error, LinkState, RunReport, RunState,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Streaming;

struct TestFarm {
    url: String,
    handle: CoordinatorHandle,
    run: JoinHandle<farm_core::Result<RunReport>>,
    _stop: oneshot::Sender<()>,
}

async fn start_farm(config: CoordinatorConfig) -> Result<TestFarm> {
    let port = portpicker::pick_unused_port().ok_or_else(|| anyhow!("no free port"))?;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;

    let coordinator = Coordinator::new(config)?;
    let handle = coordinator.handle();
    let service = FarmService::new(handle.clone());
    let server = FarmServer::with_config(
        service,
        ServerConfig {
            addr,
            ..Default::default()
        },
    );

    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        stopped.await.ok();
    }));
    let run = tokio::spawn(async move { coordinator.run().await });

    Ok(TestFarm {
        url: format!("http://127.0.0.1:{port}"),
        handle,
        run,
        _stop: stop,
    })
}

async fn client(url: &str) -> Result<FarmClient<Channel>> {
    for _ in 0..50 {
        if let Ok(client) = FarmClient::connect(url.to_string()).await {
            return Ok(client);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(anyhow!("server at {url} never came up"))
}

struct RemoteWorker {
    id: String,
    tx: Option<mpsc::Sender<WorkerMessage>>,
    inbound: Streaming<CoordinatorMessage>,
}

impl RemoteWorker {
    async fn attach(url: &str, worker_id: &str) -> Result<Self> {
        Self::attach_with(url, worker_id, false).await
    }

    async fn resume(url: &str, worker_id: &str) -> Result<Self> {
        Self::attach_with(url, worker_id, true).await
    }

    async fn attach_with(url: &str, worker_id: &str, resume: bool) -> Result<Self> {
        let mut client = client(url).await?;
        let (tx, rx) = mpsc::channel(16);
        tx.send(WorkerMessage {
            kind: Some(worker_message::Kind::Hello(Hello {
                worker_id: worker_id.to_string(),
                hostname: "test-host".to_string(),
                resume,
            })),
        })
        .await?;

        let mut inbound = client.attach(ReceiverStream::new(rx)).await?.into_inner();
        let id = match next_kind(&mut inbound).await? {
            coordinator_message::Kind::Welcome(welcome) => welcome.worker_id,
            other => return Err(anyhow!("expected welcome, got {other:?}")),
        };
        Ok(Self {
            id,
            tx: Some(tx),
            inbound,
        })
    }

    async fn next_job(&mut self) -> Result<JobAssignment> {
        match next_kind(&mut self.inbound).await? {
            coordinator_message::Kind::Job(job) => Ok(job),
            other => Err(anyhow!("expected job, got {other:?}")),
        }
    }

    async fn send(&self, kind: worker_message::Kind) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow!("outbound stream closed"))?;
        tx.send(WorkerMessage { kind: Some(kind) }).await?;
        Ok(())
    }

    /// Finish the outbound half without a Goodbye, leaving the inbound half open
    fn end_stream(&mut self) {
        self.tx = None;
    }

    async fn finish(&self, job: JobAssignment) -> Result<()> {
        self.send(worker_message::Kind::Result(JobResult {
            job_id: job.job_id,
            success: true,
            payload: job.payload,
            error: String::new(),
        }))
        .await
    }
}

async fn eventually<F>(what: &str, condition: F) -> Result<()>
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for {what}"))
}

fn link_state(handle: &CoordinatorHandle, worker_id: &str) -> Option<LinkState> {
    handle
        .workers()
        .into_iter()
        .find(|w| w.id == worker_id)
        .map(|w| w.link_state)
}

async fn next_kind(inbound: &mut Streaming<CoordinatorMessage>) -> Result<coordinator_message::Kind> {
    let message = tokio::time::timeout(Duration::from_secs(5), inbound.message())
        .await??
        .ok_or_else(|| anyhow!("attach stream closed"))?;
    message.kind.ok_or_else(|| anyhow!("empty coordinator message"))
}

#[tokio::test]
async fn test_job_completes_over_grpc() -> Result<()> {
    let farm = start_farm(CoordinatorConfig::default()).await?;
    let mut operator = client(&farm.url).await?;

    let submitted = operator
        .submit_jobs(SubmitRequest {
            payloads: vec![b"render frame 1".to_vec()],
        })
        .await?
        .into_inner();
    assert_eq!(submitted.job_ids, vec![1]);

    let mut worker = RemoteWorker::attach(&farm.url, "").await?;
    assert!(!worker.id.is_empty());
    let job = worker.next_job().await?;
    assert_eq!(job.job_id, 1);
    assert_eq!(job.attempt, 1);
    worker.finish(job).await?;

    let report = tokio::time::timeout(Duration::from_secs(5), farm.run).await???;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].worker_id.as_deref(), Some(worker.id.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_crashed_worker_job_moves_to_survivor() -> Result<()> {
    let farm = start_farm(CoordinatorConfig {
        max_worker_loss: 2,
        ..Default::default()
    })
    .await?;
    farm.handle.submit_job(bytes::Bytes::from_static(b"frame"));

    let mut first = RemoteWorker::attach(&farm.url, "w1").await?;
    let job = first.next_job().await?;
    let mut second = RemoteWorker::attach(&farm.url, "w2").await?;

    first
        .send(worker_message::Kind::Crash(Crash {
            reason: format!("job {} segfaulted", job.job_id),
        }))
        .await?;

    let retried = second.next_job().await?;
    assert_eq!(retried.job_id, job.job_id);
    assert_eq!(retried.attempt, 2);

    let status = client(&farm.url)
        .await?
        .get_status(StatusRequest {})
        .await?
        .into_inner();
    assert_eq!(status.lost_worker_count, 1);
    assert_eq!(status.active_workers, 1);
    assert_eq!(status.assigned_jobs, 1);

    second.finish(retried).await?;
    let report = tokio::time::timeout(Duration::from_secs(5), farm.run).await???;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.lost_worker_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_supervisor_report_trips_threshold() -> Result<()> {
    let farm = start_farm(CoordinatorConfig {
        max_worker_loss: 0,
        ..Default::default()
    })
    .await?;
    farm.handle.submit_job(bytes::Bytes::from_static(b"frame"));

    let mut worker = RemoteWorker::attach(&farm.url, "w1").await?;
    let _spare = RemoteWorker::attach(&farm.url, "w2").await?;
    worker.next_job().await?;

    let ack = client(&farm.url)
        .await?
        .report_lost(LostReport {
            worker_id: "w1".to_string(),
            reason: "node rebooted".to_string(),
        })
        .await?
        .into_inner();
    assert!(ack.accepted);

    let err = tokio::time::timeout(Duration::from_secs(5), farm.run)
        .await??
        .unwrap_err();
    assert!(matches!(
        err,
        Error::MaxWorkerLoss {
            lost_worker_count: 1,
            max_worker_loss: 0,
            ..
        }
    ));
    assert_eq!(farm.handle.state(), RunState::FatalMaxLoss);
    Ok(())
}

#[tokio::test]
async fn test_dropped_stream_resumes_without_loss() -> Result<()> {
    let farm = start_farm(CoordinatorConfig::default()).await?;
    farm.handle.submit_job(bytes::Bytes::from_static(b"frame"));

    let mut first = RemoteWorker::attach(&farm.url, "w1").await?;
    let job = first.next_job().await?;
    assert_eq!(job.attempt, 1);

    // The stream ends without a Goodbye: a transient disconnect
    first.end_stream();
    eventually("worker to be reconnecting", || {
        link_state(&farm.handle, "w1") == Some(LinkState::Reconnecting)
    })
    .await?;
    assert_eq!(farm.handle.lost_worker_count(), 0);
    assert_eq!(farm.handle.status().jobs.assigned, 1);

    let mut resumed = RemoteWorker::resume(&farm.url, "w1").await?;
    assert_eq!(resumed.id, "w1");
    let redelivered = resumed.next_job().await?;
    assert_eq!(redelivered.job_id, job.job_id);
    assert_eq!(redelivered.attempt, 1);
    assert_eq!(link_state(&farm.handle, "w1"), Some(LinkState::Connected));

    resumed.finish(redelivered).await?;
    let report = tokio::time::timeout(Duration::from_secs(5), farm.run).await???;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.lost_worker_count, 0);
    assert_eq!(report.results[0].attempts, 1);
    Ok(())
}

#[tokio::test]
async fn test_replaced_stream_stays_quiet() -> Result<()> {
    let farm = start_farm(CoordinatorConfig::default()).await?;
    farm.handle.submit_job(bytes::Bytes::from_static(b"frame"));

    let mut stale = RemoteWorker::attach(&farm.url, "w1").await?;
    stale.next_job().await?;

    // Resume while the first stream is still open, then let it die
    let mut resumed = RemoteWorker::resume(&farm.url, "w1").await?;
    let job = resumed.next_job().await?;
    stale.end_stream();
    drop(stale);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(link_state(&farm.handle, "w1"), Some(LinkState::Connected));
    assert_eq!(farm.handle.lost_worker_count(), 0);

    resumed.finish(job).await?;
    let report = tokio::time::timeout(Duration::from_secs(5), farm.run).await???;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.lost_worker_count, 0);
    Ok(())
}

#[tokio::test]
async fn test_resume_after_loss_registers_fresh() -> Result<()> {
    let farm = start_farm(CoordinatorConfig {
        max_worker_loss: 5,
        no_worker_kill: false,
        ..Default::default()
    })
    .await?;
    farm.handle.submit_job(bytes::Bytes::from_static(b"frame"));

    let mut worker = RemoteWorker::attach(&farm.url, "w1").await?;
    worker.next_job().await?;
    client(&farm.url)
        .await?
        .report_lost(LostReport {
            worker_id: "w1".to_string(),
            reason: "node rebooted".to_string(),
        })
        .await?;
    eventually("loss recorded", || farm.handle.lost_worker_count() == 1).await?;

    // The old session is gone, so a resume starts a new one
    let mut back = RemoteWorker::resume(&farm.url, "w1").await?;
    let job = back.next_job().await?;
    assert_eq!(job.job_id, 1);
    assert_eq!(job.attempt, 2);

    back.finish(job).await?;
    let report = tokio::time::timeout(Duration::from_secs(5), farm.run).await???;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.lost_worker_count, 1);
    drop(worker);
    Ok(())
}
