//! gRPC service implementation for the farm coordinator
//!
//! Implements all methods defined in farm.proto. Each `Attach` stream is
//! translated into core events: results and departures are forwarded as is,
//! stream faults are classified into a `TransportFault` so the core can tell
//! a transient drop from a dead worker.

use std::pin::Pin;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use farm_core::{
    ConnectionEvent, CoordinatorHandle, Error as FarmError, JobResult, TransportFault,
    WorkerCommand, WorkerId, WorkerLink,
};

use crate::middleware::InputValidator;
use crate::proto::{
    self, coordinator_message, farm_server::Farm, worker_message, CoordinatorMessage, LostAck,
    LostReport, StatusRequest, StatusResponse, SubmitRequest, SubmitResponse, WorkerMessage,
};

type OutboundSender = mpsc::UnboundedSender<Result<CoordinatorMessage, Status>>;

/// Worker link writing to the outbound half of an `Attach` stream
#[derive(Debug)]
pub struct GrpcLink {
    tx: OutboundSender,
}

impl GrpcLink {
    fn new(tx: OutboundSender) -> Self {
        Self { tx }
    }
}

impl WorkerLink for GrpcLink {
    fn send(&self, command: WorkerCommand) -> farm_core::Result<()> {
        let kind = match command {
            WorkerCommand::Run(assignment) => coordinator_message::Kind::Job(proto::JobAssignment {
                job_id: assignment.job_id,
                payload: assignment.payload.to_vec(),
                attempt: assignment.attempt,
            }),
            WorkerCommand::Shutdown { reason } => {
                coordinator_message::Kind::Shutdown(proto::Shutdown { reason })
            }
        };
        self.tx
            .send(Ok(CoordinatorMessage { kind: Some(kind) }))
            .map_err(|_| FarmError::ChannelClosed {
                channel: "attach stream".to_string(),
            })
    }
}

/// Classify a failed inbound stream by its status code
pub fn classify_status(status: &Status) -> TransportFault {
    let reason = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted => {
            TransportFault::Retryable(reason)
        }
        _ => TransportFault::ClosedWithError(reason),
    }
}

/// Narrow a count for the wire, clamping instead of wrapping
fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Map a core error onto a gRPC status
pub fn to_status(error: FarmError) -> Status {
    match &error {
        FarmError::DuplicateWorker { .. } => Status::already_exists(error.to_string()),
        FarmError::WorkerNotFound { .. } | FarmError::JobNotFound { .. } => {
            Status::not_found(error.to_string())
        }
        FarmError::InvalidConfig { .. } => Status::invalid_argument(error.to_string()),
        FarmError::ChannelClosed { .. } => Status::unavailable(error.to_string()),
        FarmError::MountTimeout { .. } => Status::deadline_exceeded(error.to_string()),
        _ => Status::internal(error.to_string()),
    }
}

/// Coordinator gRPC service
#[derive(Clone)]
pub struct FarmService {
    /// Handle to the running coordinator
    coordinator: CoordinatorHandle,

    /// Validation for worker supplied input
    validator: Arc<InputValidator>,
}

impl FarmService {
    /// Create a service for `coordinator`
    pub fn new(coordinator: CoordinatorHandle) -> Self {
        Self::with_validator(coordinator, InputValidator::new())
    }

    /// Create a service with a custom validator
    pub fn with_validator(coordinator: CoordinatorHandle, validator: InputValidator) -> Self {
        Self {
            coordinator,
            validator: Arc::new(validator),
        }
    }

    /// Coordinator handle shared with the HTTP API
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Input validator shared with the HTTP API
    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    /// Submit payloads after validating them
    pub fn submit_payloads(&self, payloads: Vec<Vec<u8>>) -> Result<Vec<u64>, Status> {
        self.validator.validate_batch(&payloads)?;
        let ids = self
            .coordinator
            .submit_jobs(payloads.into_iter().map(Bytes::from));
        info!(count = ids.len(), "Jobs submitted");
        Ok(ids)
    }

    /// Forward a supervisor's loss report, returning whether the worker was known
    pub fn report_lost_worker(&self, worker_id: &str, reason: &str) -> Result<bool, Status> {
        self.validator.validate_worker_id(worker_id)?;
        self.validator.validate_reason(reason)?;

        let known = self.coordinator.is_registered(worker_id);
        warn!(worker_id = %worker_id, reason = %reason, known, "Supervisor reported worker lost");
        self.coordinator
            .report_connection(ConnectionEvent::faulted(
                worker_id,
                TransportFault::SupervisorReported(reason.to_string()),
            ))
            .map_err(to_status)?;
        Ok(known)
    }
}

/// Read the inbound half of an `Attach` stream until it ends.
///
/// `current` is the link registered for this stream; once a reconnect has
/// replaced it, the stream is stale and its end is not reported.
async fn pump_inbound(
    mut inbound: Streaming<WorkerMessage>,
    worker_id: WorkerId,
    current: Weak<GrpcLink>,
    coordinator: CoordinatorHandle,
) {
    loop {
        let forwarded = match inbound.next().await {
            Some(Ok(message)) => match message.kind {
                Some(worker_message::Kind::Result(result)) => {
                    let outcome = if result.success {
                        JobResult::Success(Bytes::from(result.payload))
                    } else {
                        JobResult::Failure(result.error)
                    };
                    coordinator.report_result(worker_id.clone(), result.job_id, outcome)
                }
                Some(worker_message::Kind::Crash(crash)) => {
                    warn!(worker_id = %worker_id, reason = %crash.reason, "Worker reported crash");
                    let _ = coordinator.report_connection(ConnectionEvent::faulted(
                        worker_id.clone(),
                        TransportFault::Crashed(crash.reason),
                    ));
                    return;
                }
                Some(worker_message::Kind::Goodbye(_)) => {
                    info!(worker_id = %worker_id, "Worker said goodbye");
                    let _ = coordinator.report_departure(worker_id.clone());
                    return;
                }
                Some(worker_message::Kind::Hello(_)) => {
                    warn!(worker_id = %worker_id, "Ignoring repeated Hello");
                    Ok(())
                }
                None => {
                    debug!(worker_id = %worker_id, "Empty worker message");
                    Ok(())
                }
            },
            Some(Err(status)) => {
                if current.upgrade().is_some() {
                    let fault = classify_status(&status);
                    warn!(worker_id = %worker_id, fault = %fault, "Attach stream failed");
                    let _ = coordinator
                        .report_connection(ConnectionEvent::faulted(worker_id.clone(), fault));
                }
                return;
            }
            None => {
                if current.upgrade().is_some() {
                    let _ = coordinator.report_connection(ConnectionEvent::disconnected(
                        worker_id.clone(),
                        "attach stream closed without goodbye",
                    ));
                }
                return;
            }
        };

        if forwarded.is_err() {
            debug!(worker_id = %worker_id, "Coordinator stopped, closing attach stream");
            return;
        }
    }
}

#[tonic::async_trait]
impl Farm for FarmService {
    type AttachStream = Pin<Box<dyn Stream<Item = Result<CoordinatorMessage, Status>> + Send>>;

    /// Open a worker session
    async fn attach(
        &self,
        request: Request<Streaming<WorkerMessage>>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let mut inbound = request.into_inner();

        let hello = match inbound.next().await {
            Some(Ok(WorkerMessage {
                kind: Some(worker_message::Kind::Hello(hello)),
            })) => hello,
            Some(Ok(_)) => return Err(Status::invalid_argument("First message must be Hello")),
            Some(Err(status)) => return Err(status),
            None => return Err(Status::invalid_argument("Stream closed before Hello")),
        };
        self.validator.validate_requested_id(&hello.worker_id)?;
        self.validator.validate_hostname(&hello.hostname)?;

        let worker_id = if hello.worker_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            hello.worker_id.clone()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Welcome goes out before any job can be queued behind it
        let welcome = CoordinatorMessage {
            kind: Some(coordinator_message::Kind::Welcome(proto::Welcome {
                worker_id: worker_id.clone(),
                capacity: saturating_u32(self.coordinator.config().jobs_per_worker),
            })),
        };
        tx.send(Ok(welcome))
            .map_err(|_| Status::internal("Outbound stream closed"))?;

        let link = Arc::new(GrpcLink::new(tx));
        let current = Arc::downgrade(&link);

        if hello.resume && self.coordinator.is_registered(&worker_id) {
            info!(worker_id = %worker_id, "Worker resuming session");
            self.coordinator
                .report_connection(ConnectionEvent::reconnected(worker_id.clone(), link))
                .map_err(to_status)?;
        } else {
            info!(
                worker_id = %worker_id,
                hostname = %hello.hostname,
                "Worker attach request"
            );
            self.coordinator
                .connect(Some(worker_id.clone()), hello.hostname, link)
                .await
                .map_err(to_status)?;
        }

        tokio::spawn(pump_inbound(
            inbound,
            worker_id,
            current,
            self.coordinator.clone(),
        ));

        let outbound = UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(outbound) as Self::AttachStream))
    }

    /// Supervisor reports a dead worker
    async fn report_lost(&self, request: Request<LostReport>) -> Result<Response<LostAck>, Status> {
        let report = request.into_inner();
        let accepted = self.report_lost_worker(&report.worker_id, &report.reason)?;
        Ok(Response::new(LostAck { accepted }))
    }

    /// Append jobs to the queue
    async fn submit_jobs(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let job_ids = self.submit_payloads(request.into_inner().payloads)?;
        Ok(Response::new(SubmitResponse { job_ids }))
    }

    /// Coordinator snapshot
    async fn get_status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let status = self.coordinator.status();
        Ok(Response::new(StatusResponse {
            state: format!("{:?}", status.state),
            active_workers: saturating_u32(status.active_workers),
            lost_worker_count: status.lost_worker_count,
            max_worker_loss: status.max_worker_loss,
            no_worker_kill: status.no_worker_kill,
            pending_jobs: status.jobs.pending as u64,
            assigned_jobs: status.jobs.assigned as u64,
            completed_jobs: status.jobs.completed,
            failed_jobs: status.jobs.failed,
        }))
    }
}
