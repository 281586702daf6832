//! Demo worker
//!
//! Usage: `farm-worker [COORDINATOR_URL] [WORKER_ID]`
//!
//! Echoes every job payload back as its result. A payload of `crash`
//! makes the process report a crash and exit, which is how a poisoned job
//! looks to the coordinator.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordinator::proto::{
    coordinator_message, worker_message, Crash, Goodbye, Hello, JobResult, WorkerMessage,
};
use coordinator::server::BoxError;
use coordinator::FarmClient;

const POISON: &[u8] = b"crash";

fn message(kind: worker_message::Kind) -> WorkerMessage {
    WorkerMessage { kind: Some(kind) }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "farm_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "http://127.0.0.1:50051".to_string());
    let worker_id = args.next().unwrap_or_default();
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

    let mut client = FarmClient::connect(url.clone()).await?;
    info!(url = %url, "Connected to coordinator");

    let (tx, rx) = mpsc::channel(32);
    tx.send(message(worker_message::Kind::Hello(Hello {
        worker_id,
        hostname,
        resume: false,
    })))
    .await?;

    let mut inbound = client.attach(ReceiverStream::new(rx)).await?.into_inner();

    while let Some(msg) = inbound.message().await? {
        match msg.kind {
            Some(coordinator_message::Kind::Welcome(welcome)) => {
                info!(
                    worker_id = %welcome.worker_id,
                    capacity = welcome.capacity,
                    "Attached"
                );
            }
            Some(coordinator_message::Kind::Job(job)) => {
                if job.payload == POISON {
                    warn!(job_id = job.job_id, "Poisoned job, crashing");
                    tx.send(message(worker_message::Kind::Crash(Crash {
                        reason: format!("job {} crashed the worker", job.job_id),
                    })))
                    .await?;
                    // Let the crash report reach the coordinator
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    std::process::exit(1);
                }

                info!(job_id = job.job_id, attempt = job.attempt, "Running job");
                tx.send(message(worker_message::Kind::Result(JobResult {
                    job_id: job.job_id,
                    success: true,
                    payload: job.payload,
                    error: String::new(),
                })))
                .await?;
            }
            Some(coordinator_message::Kind::Shutdown(shutdown)) => {
                info!(reason = %shutdown.reason, "Coordinator asked us to stop");
                tx.send(message(worker_message::Kind::Goodbye(Goodbye {})))
                    .await?;
                break;
            }
            None => {}
        }
    }

    info!("Worker exiting");
    Ok(())
}
