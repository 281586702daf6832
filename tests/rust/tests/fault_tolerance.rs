//! Loss handling and policy tests against an in-process coordinator
//!
//! Workers are simulated with channel links, so every scenario runs without
//! a network and the order of events is controlled by the test.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use farm_core::{
    ChannelLink, ConnectionEvent, Coordinator, CoordinatorConfig, CoordinatorHandle, Error,
    JobFailurePolicy, JobResult, RunReport, RunState, TransportFault, WorkerCommand,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const POISON: &[u8] = b"poison";

/// How a simulated worker reacts to a job
#[derive(Debug, Clone, Copy)]
enum Behaviour {
    /// Return the payload as the result
    Echo,
    /// Keep the job forever
    Hold,
    /// Echo, except that a poisoned payload kills the worker
    DieOnPoison,
    /// Report every job as failed
    Fail,
}

type RunHandle = JoinHandle<farm_core::Result<RunReport>>;

fn start(config: CoordinatorConfig) -> Result<(CoordinatorHandle, RunHandle)> {
    let coordinator = Coordinator::new(config)?;
    let handle = coordinator.handle();
    let run = tokio::spawn(async move { coordinator.run().await });
    Ok((handle, run))
}

fn submit(handle: &CoordinatorHandle, payloads: &[&'static [u8]]) -> Vec<u64> {
    handle.submit_jobs(payloads.iter().map(|p| Bytes::from_static(p)))
}

async fn spawn_worker(handle: &CoordinatorHandle, id: &str, behaviour: Behaviour) -> Result<JoinHandle<()>> {
    let (link, rx) = ChannelLink::new();
    handle
        .connect(Some(id.to_string()), "sim-host", Arc::new(link))
        .await?;
    Ok(tokio::spawn(simulate(handle.clone(), id.to_string(), rx, behaviour)))
}

async fn simulate(
    handle: CoordinatorHandle,
    id: String,
    mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
    behaviour: Behaviour,
) {
    while let Some(command) = rx.recv().await {
        let job = match command {
            WorkerCommand::Run(job) => job,
            WorkerCommand::Shutdown { .. } => return,
        };
        let result = match behaviour {
            Behaviour::Hold => continue,
            Behaviour::DieOnPoison if job.payload == POISON => {
                let _ = handle.report_connection(ConnectionEvent::faulted(
                    id.clone(),
                    TransportFault::Crashed(format!("job {} killed the worker", job.job_id)),
                ));
                return;
            }
            Behaviour::Fail => JobResult::Failure("bad input".to_string()),
            Behaviour::Echo | Behaviour::DieOnPoison => JobResult::Success(job.payload),
        };
        if handle.report_result(id.clone(), job.job_id, result).is_err() {
            return;
        }
    }
}

fn crash(handle: &CoordinatorHandle, id: &str) -> Result<()> {
    handle.report_connection(ConnectionEvent::faulted(
        id,
        TransportFault::Crashed("killed".to_string()),
    ))?;
    Ok(())
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

fn config() -> CoordinatorConfig {
    CoordinatorConfig::default()
}

#[tokio::test]
async fn test_lost_jobs_are_reclaimed_exactly_once() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        max_worker_loss: 5,
        ..config()
    })?;
    submit(&handle, &[b"1", b"2", b"3", b"4"]);
    for id in ["w1", "w2", "w3", "w4"] {
        spawn_worker(&handle, id, Behaviour::Hold).await?;
    }
    eventually("all jobs assigned", || handle.status().jobs.assigned == 4).await?;

    crash(&handle, "w1")?;
    crash(&handle, "w3")?;
    eventually("two losses", || handle.lost_worker_count() == 2).await?;

    // Every job is either pending or held by exactly one surviving worker
    let jobs = handle.jobs();
    assert_eq!(jobs.len(), 4);
    let workers = handle.workers();
    for job in &jobs {
        let holders: Vec<_> = workers
            .iter()
            .filter(|w| w.assigned_jobs.contains(&job.id))
            .map(|w| w.id.as_str())
            .collect();
        match job.assigned_worker.as_deref() {
            Some(worker) => assert_eq!(holders, vec![worker]),
            None => assert!(holders.is_empty()),
        }
    }
    assert_eq!(handle.pending_ids(), vec![1, 3]);

    handle.shutdown();
    let report = run.await??;
    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(report.lost_worker_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_requeued_jobs_go_behind_pending_jobs() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        min_workers: 2,
        ..config()
    })?;
    submit(&handle, &[b"1", b"2", b"3", b"4"]);
    spawn_worker(&handle, "a", Behaviour::Hold).await?;
    spawn_worker(&handle, "b", Behaviour::Hold).await?;
    eventually("two jobs assigned", || handle.status().jobs.assigned == 2).await?;
    assert_eq!(handle.pending_ids(), vec![3, 4]);

    crash(&handle, "a")?;
    eventually("loss recorded", || handle.lost_worker_count() == 1).await?;
    assert_eq!(handle.pending_ids(), vec![3, 4, 1]);

    handle.shutdown();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn test_max_worker_loss_threshold() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        max_worker_loss: 1,
        ..config()
    })?;
    submit(&handle, &[b"1", b"2", b"3"]);
    for id in ["w1", "w2", "w3"] {
        spawn_worker(&handle, id, Behaviour::Hold).await?;
    }

    crash(&handle, "w1")?;
    eventually("first loss", || handle.lost_worker_count() == 1).await?;
    assert_eq!(handle.state(), RunState::Running);

    crash(&handle, "w2")?;
    let err = run.await?.unwrap_err();
    match &err {
        Error::MaxWorkerLoss {
            lost_worker_count,
            max_worker_loss,
            unfinished,
        } => {
            assert_eq!(*lost_worker_count, 2);
            assert_eq!(*max_worker_loss, 1);
            assert_eq!(unfinished, &vec![1, 2, 3]);
        }
        other => panic!("expected MaxWorkerLoss, got {other:?}"),
    }
    assert!(err.is_fatal());
    assert_eq!(handle.state(), RunState::FatalMaxLoss);
    Ok(())
}

#[tokio::test]
async fn test_no_worker_kill_aborts_when_pool_is_empty() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        max_worker_loss: 5,
        no_worker_kill: true,
        ..config()
    })?;
    submit(&handle, &[b"1", b"2", b"3"]);
    spawn_worker(&handle, "w1", Behaviour::Hold).await?;
    spawn_worker(&handle, "w2", Behaviour::Hold).await?;

    crash(&handle, "w1")?;
    crash(&handle, "w2")?;

    let err = run.await?.unwrap_err();
    assert!(matches!(
        err,
        Error::NoWorkersFound {
            lost_worker_count: 2,
            max_worker_loss: 5,
            ..
        }
    ));
    assert_eq!(handle.state(), RunState::FatalNoWorkers);
    Ok(())
}

#[tokio::test]
async fn test_without_no_worker_kill_run_idles() -> Result<()> {
    let (handle, mut run) = start(CoordinatorConfig {
        max_worker_loss: 5,
        no_worker_kill: false,
        ..config()
    })?;
    submit(&handle, &[b"1", b"2", b"3"]);
    spawn_worker(&handle, "w1", Behaviour::Hold).await?;
    spawn_worker(&handle, "w2", Behaviour::Hold).await?;

    crash(&handle, "w1")?;
    crash(&handle, "w2")?;
    eventually("both losses", || handle.lost_worker_count() == 2).await?;

    // Nothing fatal happens: the run waits for workers that never come
    assert!(tokio::time::timeout(Duration::from_millis(200), &mut run)
        .await
        .is_err());
    let status = handle.status();
    assert_eq!(status.state, RunState::Running);
    assert_eq!(status.active_workers, 0);
    assert_eq!(status.jobs.pending, 3);

    // A new worker picks the work back up
    spawn_worker(&handle, "w3", Behaviour::Echo).await?;
    let report = run.await??;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.results.len(), 3);
    assert!(report
        .results
        .iter()
        .all(|r| r.worker_id.as_deref() == Some("w3")));
    Ok(())
}

#[tokio::test]
async fn test_poisoned_job_cascade() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        max_worker_loss: 2,
        min_workers: 3,
        ..config()
    })?;
    submit(&handle, &[POISON, b"ok-1", b"ok-2"]);
    for id in ["w1", "w2", "w3"] {
        spawn_worker(&handle, id, Behaviour::DieOnPoison).await?;
    }

    // The poisoned job migrates from worker to worker, killing each one
    let err = run.await?.unwrap_err();
    match err {
        Error::MaxWorkerLoss {
            lost_worker_count,
            max_worker_loss,
            unfinished,
        } => {
            assert_eq!(lost_worker_count, 3);
            assert_eq!(max_worker_loss, 2);
            assert_eq!(unfinished, vec![1]);
        }
        other => panic!("expected MaxWorkerLoss, got {other:?}"),
    }

    let finished = handle.take_results();
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|r| r.is_success()));
    Ok(())
}

#[tokio::test]
async fn test_attempt_cap_contains_poisoned_job() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        max_worker_loss: 5,
        min_workers: 3,
        max_job_attempts: Some(2),
        ..config()
    })?;
    submit(&handle, &[POISON]);
    for id in ["w1", "w2", "w3"] {
        spawn_worker(&handle, id, Behaviour::DieOnPoison).await?;
    }

    let report = run.await??;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.lost_worker_count, 2);
    assert_eq!(report.results.len(), 1);
    let outcome = &report.results[0];
    assert_eq!(outcome.job_id, 1);
    assert_eq!(outcome.attempts, 2);
    assert!(!outcome.is_success());
    assert_eq!(handle.status().active_workers, 1);
    Ok(())
}

#[tokio::test]
async fn test_double_loss_counts_once() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        max_worker_loss: 5,
        ..config()
    })?;
    submit(&handle, &[b"1"]);
    spawn_worker(&handle, "w1", Behaviour::Hold).await?;
    spawn_worker(&handle, "w2", Behaviour::Hold).await?;

    crash(&handle, "w1")?;
    crash(&handle, "w1")?;
    handle.report_connection(ConnectionEvent::faulted(
        "w1",
        TransportFault::SupervisorReported("pid 4242 exited".to_string()),
    ))?;
    eventually("loss recorded", || handle.lost_worker_count() == 1).await?;

    // Let the duplicate signals drain through the loop
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.lost_worker_count(), 1);
    assert_eq!(handle.jobs()[0].assigned_worker.as_deref(), Some("w2"));

    handle.shutdown();
    assert_eq!(run.await??.lost_worker_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_transient_disconnect_and_redelivery() -> Result<()> {
    let (handle, run) = start(config())?;
    submit(&handle, &[b"payload"]);
    let (link, mut old_rx) = ChannelLink::new();
    handle.connect(Some("w1".to_string()), "host", Arc::new(link)).await?;
    eventually("job assigned", || handle.status().jobs.assigned == 1).await?;
    assert!(matches!(old_rx.try_recv(), Ok(WorkerCommand::Run(_))));

    handle.report_connection(ConnectionEvent::disconnected("w1", "connection reset"))?;
    handle.report_connection(ConnectionEvent::faulted(
        "w1",
        TransportFault::Retryable("unavailable".to_string()),
    ))?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.lost_worker_count(), 0);
    assert!(handle.is_registered("w1"));

    let (link, mut new_rx) = ChannelLink::new();
    handle.report_connection(ConnectionEvent::reconnected("w1", Arc::new(link)))?;
    let job = tokio::time::timeout(Duration::from_secs(5), new_rx.recv())
        .await?
        .ok_or_else(|| anyhow!("link closed"))?;
    let job = match job {
        WorkerCommand::Run(job) => job,
        other => return Err(anyhow!("unexpected command {other:?}")),
    };
    assert_eq!(job.job_id, 1);
    assert_eq!(job.attempt, 1);

    handle.report_result("w1", job.job_id, JobResult::Success(job.payload))?;
    let report = run.await??;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.lost_worker_count, 0);
    Ok(())
}

#[tokio::test]
async fn test_departure_requeues_without_counting_loss() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        min_workers: 2,
        ..config()
    })?;
    submit(&handle, &[b"1"]);
    spawn_worker(&handle, "w1", Behaviour::Hold).await?;
    spawn_worker(&handle, "w2", Behaviour::Echo).await?;
    eventually("job assigned", || handle.status().jobs.assigned == 1).await?;

    handle.report_departure("w1")?;
    let report = run.await??;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.lost_worker_count, 0);
    assert_eq!(report.results[0].worker_id.as_deref(), Some("w2"));
    assert_eq!(report.results[0].attempts, 2);
    assert_eq!(handle.status().departed_workers, 1);
    Ok(())
}

#[tokio::test]
async fn test_retry_policy_respects_attempt_cap() -> Result<()> {
    let (handle, run) = start(CoordinatorConfig {
        job_failure_policy: JobFailurePolicy::Retry,
        max_job_attempts: Some(3),
        ..config()
    })?;
    submit(&handle, &[b"bad"]);
    spawn_worker(&handle, "w1", Behaviour::Fail).await?;

    let report = run.await??;
    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].attempts, 3);
    assert!(!report.results[0].is_success());
    assert_eq!(report.lost_worker_count, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_leaves_jobs_with_their_workers() -> Result<()> {
    let (handle, run) = start(config())?;
    submit(&handle, &[b"1", b"2", b"3"]);
    spawn_worker(&handle, "w1", Behaviour::Hold).await?;
    spawn_worker(&handle, "w2", Behaviour::Hold).await?;
    eventually("two jobs assigned", || handle.status().jobs.assigned == 2).await?;

    handle.shutdown();
    let report = run.await??;
    assert_eq!(report.state, RunState::Cancelled);

    let held: usize = handle.workers().iter().map(|w| w.assigned_jobs.len()).sum();
    let status = handle.status();
    assert_eq!(held, 2);
    assert_eq!(status.jobs.assigned, 2);
    assert_eq!(status.jobs.pending, 1);

    assert_eq!(handle.disconnect_workers("run cancelled"), 2);
    Ok(())
}
