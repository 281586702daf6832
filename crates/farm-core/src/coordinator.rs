//! Coordinator state machine and event loop
//!
//! Every input from the transports (handshakes, connection events, job
//! results, departures) is funnelled into one ordered channel consumed by
//! [`Coordinator::run`]. The loop is the only writer of the loss counter and
//! the run state, which keeps the loss policy decisions sequential.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::Allocator;
use crate::config::{CoordinatorConfig, JobFailurePolicy};
use crate::detector::{ConnectionEvent, ConnectionEventKind, FailureDetector, Verdict};
use crate::queue::{JobQueue, QueueStats};
use crate::worker::{LossEvent, WorkerInfo, WorkerLink, WorkerRegistry, WorkerRegistryHandle};
use crate::{Error, Job, JobId, JobOutcome, JobResult, Result, WorkerCommand, WorkerId};

/// Shutdown signal sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Shutdown signal receiver
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// Lifecycle of a coordinator run
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum RunState {
    /// Waiting for the first workers to connect
    Starting,

    /// Dispatching jobs
    Running,

    /// Every job has an outcome
    Complete,

    /// Stopped by a shutdown request
    Cancelled,

    /// Aborted: more workers lost than `max_worker_loss`
    FatalMaxLoss,

    /// Aborted: every worker lost while `no_worker_kill` is set
    FatalNoWorkers,
}

impl RunState {
    /// Returns true once the run can no longer make progress
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Starting | RunState::Running)
    }

    /// Returns true for the states a loss policy ends in
    pub fn is_fatal(&self) -> bool {
        matches!(self, RunState::FatalMaxLoss | RunState::FatalNoWorkers)
    }
}

/// Input to the coordinator event loop
pub enum WorkerEvent {
    /// Worker handshake. An empty or missing id gets a generated one.
    Connect {
        worker_id: Option<WorkerId>,
        hostname: String,
        link: Arc<dyn WorkerLink>,
        reply: Option<oneshot::Sender<Result<WorkerId>>>,
    },

    /// Transport-level change for a registered worker
    Connection(ConnectionEvent),

    /// A worker reported the result of a job
    JobResult {
        worker_id: WorkerId,
        job_id: JobId,
        result: JobResult,
    },

    /// A worker left on its own
    Departed { worker_id: WorkerId },

    /// New jobs were added to the queue
    JobsSubmitted,
}

impl std::fmt::Debug for WorkerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerEvent::Connect {
                worker_id, hostname, ..
            } => f
                .debug_struct("Connect")
                .field("worker_id", worker_id)
                .field("hostname", hostname)
                .finish(),
            WorkerEvent::Connection(event) => f.debug_tuple("Connection").field(event).finish(),
            WorkerEvent::JobResult {
                worker_id, job_id, ..
            } => f
                .debug_struct("JobResult")
                .field("worker_id", worker_id)
                .field("job_id", job_id)
                .finish(),
            WorkerEvent::Departed { worker_id } => f
                .debug_struct("Departed")
                .field("worker_id", worker_id)
                .finish(),
            WorkerEvent::JobsSubmitted => write!(f, "JobsSubmitted"),
        }
    }
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub state: RunState,
    pub active_workers: usize,
    pub registered_workers: u64,
    pub departed_workers: u64,
    pub lost_worker_count: u64,
    pub max_worker_loss: u64,
    pub no_worker_kill: bool,
    pub jobs: QueueStats,
    pub results_buffered: usize,
    pub results_dropped: u64,
}

/// Summary returned by a run that ended without a fatal error
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub lost_worker_count: u64,
    pub results: Vec<JobOutcome>,
}

struct Shared {
    config: CoordinatorConfig,
    registry: WorkerRegistryHandle,
    queue: Arc<JobQueue>,
    allocator: Allocator,
    detector: FailureDetector,
    state: RwLock<RunState>,
    lost_worker_count: AtomicU64,
    results: Mutex<VecDeque<JobOutcome>>,
    results_dropped: AtomicU64,
}

/// Receivers owned by whichever call to `run()` comes first
struct Receivers {
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    losses: mpsc::UnboundedReceiver<LossEvent>,
    shutdown: ShutdownReceiver,
}

/// Cloneable handle used by transports and operators to talk to a coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    shutdown_tx: ShutdownSender,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("state", &self.state())
            .field("lost_worker_count", &self.lost_worker_count())
            .finish()
    }
}

impl CoordinatorHandle {
    /// Add a job to the back of the queue
    pub fn submit_job(&self, payload: impl Into<Bytes>) -> JobId {
        let job_id = self.shared.queue.submit(payload.into());
        self.notify_submitted();
        job_id
    }

    /// Add several jobs, keeping their order
    pub fn submit_jobs<I>(&self, payloads: I) -> Vec<JobId>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let ids = self.shared.queue.submit_batch(payloads);
        if !ids.is_empty() {
            self.notify_submitted();
        }
        ids
    }

    /// Push an event into the coordinator loop
    pub fn send(&self, event: WorkerEvent) -> Result<()> {
        self.events_tx.send(event).map_err(|_| Error::ChannelClosed {
            channel: "coordinator events".to_string(),
        })
    }

    /// Register a worker through the event loop and wait for its id
    pub async fn connect(
        &self,
        worker_id: Option<WorkerId>,
        hostname: impl Into<String>,
        link: Arc<dyn WorkerLink>,
    ) -> Result<WorkerId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerEvent::Connect {
            worker_id,
            hostname: hostname.into(),
            link,
            reply: Some(reply_tx),
        })?;
        reply_rx.await.map_err(|_| Error::ChannelClosed {
            channel: "connect reply".to_string(),
        })?
    }

    /// Forward a transport event
    pub fn report_connection(&self, event: ConnectionEvent) -> Result<()> {
        self.send(WorkerEvent::Connection(event))
    }

    /// Forward a job result
    pub fn report_result(&self, worker_id: impl Into<WorkerId>, job_id: JobId, result: JobResult) -> Result<()> {
        self.send(WorkerEvent::JobResult {
            worker_id: worker_id.into(),
            job_id,
            result,
        })
    }

    /// Forward a graceful departure
    pub fn report_departure(&self, worker_id: impl Into<WorkerId>) -> Result<()> {
        self.send(WorkerEvent::Departed {
            worker_id: worker_id.into(),
        })
    }

    /// Snapshot of the coordinator
    pub fn status(&self) -> CoordinatorStatus {
        let shared = &self.shared;
        CoordinatorStatus {
            state: self.state(),
            active_workers: shared.registry.active_count(),
            registered_workers: shared.registry.registered_total(),
            departed_workers: shared.registry.departed_total(),
            lost_worker_count: self.lost_worker_count(),
            max_worker_loss: shared.config.max_worker_loss,
            no_worker_kill: shared.config.no_worker_kill,
            jobs: shared.queue.stats(),
            results_buffered: shared.results.lock().len(),
            results_dropped: shared.results_dropped.load(Ordering::SeqCst),
        }
    }

    /// Registered workers, ordered by id
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.shared.registry.all_workers()
    }

    /// Jobs that do not have an outcome yet
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.queue.snapshot()
    }

    /// Pending job ids in dispatch order
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.shared.queue.pending_ids()
    }

    /// Check whether a worker is registered and active
    pub fn is_registered(&self, worker_id: &str) -> bool {
        self.shared.registry.is_active(worker_id)
    }

    /// Drain the outcomes recorded so far
    pub fn take_results(&self) -> Vec<JobOutcome> {
        self.shared.results.lock().drain(..).collect()
    }

    /// Workers lost since the coordinator was created
    pub fn lost_worker_count(&self) -> u64 {
        self.shared.lost_worker_count.load(Ordering::SeqCst)
    }

    /// Current run state
    pub fn state(&self) -> RunState {
        *self.shared.state.read()
    }

    /// Coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Ask the event loop to stop
    pub fn shutdown(&self) {
        info!("Coordinator shutdown requested");
        let _ = self.shutdown_tx.send(());
    }

    /// Tell every registered worker to stop, returning how many were reached
    pub fn disconnect_workers(&self, reason: impl Into<String>) -> usize {
        let command = WorkerCommand::Shutdown {
            reason: reason.into(),
        };
        let reached = self.shared.registry.broadcast(&command);
        info!(workers = reached, "Shutdown sent to workers");
        reached
    }

    fn notify_submitted(&self) {
        // Nobody listening just means the loop has finished
        let _ = self.events_tx.send(WorkerEvent::JobsSubmitted);
    }
}

/// Fault-tolerant job farming coordinator
pub struct Coordinator {
    handle: CoordinatorHandle,
    receivers: Mutex<Option<Receivers>>,
}

impl Coordinator {
    /// Create a coordinator, rejecting an invalid configuration
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;

        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let registry = Arc::new(WorkerRegistry::with_loss_channel(config.max_workers, loss_tx));
        let queue = Arc::new(JobQueue::new());
        let allocator = Allocator::new(registry.clone(), queue.clone(), &config);
        let detector = FailureDetector::new(registry.clone());

        let shared = Arc::new(Shared {
            config,
            registry,
            queue,
            allocator,
            detector,
            state: RwLock::new(RunState::Starting),
            lost_worker_count: AtomicU64::new(0),
            results: Mutex::new(VecDeque::new()),
            results_dropped: AtomicU64::new(0),
        });

        Ok(Self {
            handle: CoordinatorHandle {
                shared,
                events_tx,
                shutdown_tx,
            },
            receivers: Mutex::new(Some(Receivers {
                events: events_rx,
                losses: loss_rx,
                shutdown: shutdown_rx,
            })),
        })
    }

    /// Get a handle for transports and operators
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Add a job to the back of the queue
    pub fn submit_job(&self, payload: impl Into<Bytes>) -> JobId {
        self.handle.submit_job(payload)
    }

    /// Add several jobs, keeping their order
    pub fn submit_jobs<I>(&self, payloads: I) -> Vec<JobId>
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.handle.submit_jobs(payloads)
    }

    /// Snapshot of the coordinator
    pub fn status(&self) -> CoordinatorStatus {
        self.handle.status()
    }

    /// Drain the outcomes recorded so far
    pub fn take_results(&self) -> Vec<JobOutcome> {
        self.handle.take_results()
    }

    /// Ask the event loop to stop
    pub fn shutdown(&self) {
        self.handle.shutdown()
    }

    /// Tell every registered worker to stop
    pub fn disconnect_workers(&self, reason: impl Into<String>) -> usize {
        self.handle.disconnect_workers(reason)
    }

    /// Workers lost since the coordinator was created
    pub fn lost_worker_count(&self) -> u64 {
        self.handle.lost_worker_count()
    }

    /// Current run state
    pub fn state(&self) -> RunState {
        self.handle.state()
    }

    /// Drive the run until the queue drains, shutdown is requested, or a
    /// loss policy fires.
    ///
    /// Fatal policy outcomes come back as `Err(MaxWorkerLoss)` or
    /// `Err(NoWorkersFound)`. May only be called once.
    pub async fn run(&self) -> Result<RunReport> {
        let mut rx = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| Error::internal("coordinator run() called twice"))?;

        let config = &self.handle.shared.config;
        info!(
            max_worker_loss = config.max_worker_loss,
            no_worker_kill = config.no_worker_kill,
            min_workers = config.min_workers,
            "Coordinator starting"
        );

        let state = match self.event_loop(&mut rx).await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Coordinator run aborted");
                return Err(e);
            }
        };

        Ok(RunReport {
            state,
            lost_worker_count: self.lost_worker_count(),
            results: self.take_results(),
        })
    }

    async fn event_loop(&self, rx: &mut Receivers) -> Result<RunState> {
        if let Some(state) = self.mount(rx).await? {
            return Ok(state);
        }

        self.set_state(RunState::Running);
        self.dispatch()?;

        loop {
            if let Some(state) = self.finished() {
                return Ok(state);
            }

            tokio::select! {
                biased;

                _ = rx.shutdown.recv() => {
                    self.set_state(RunState::Cancelled);
                    return Ok(RunState::Cancelled);
                }
                event = rx.events.recv() => {
                    let event = event.ok_or_else(|| Error::ChannelClosed {
                        channel: "coordinator events".to_string(),
                    })?;
                    self.handle_event(event)?;
                }
                Some(loss) = rx.losses.recv() => {
                    self.handle_loss(loss)?;
                }
            }

            self.drain_losses(rx)?;
            self.check_invariants()?;
        }
    }

    /// Wait until `min_workers` are registered. Returns a final state if the
    /// run was cancelled first.
    async fn mount(&self, rx: &mut Receivers) -> Result<Option<RunState>> {
        let shared = &self.handle.shared;
        let min_workers = shared.config.min_workers;
        let mount_timeout = shared.config.mount_timeout;

        let deadline = mount_timeout.map(|t| tokio::time::Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        while shared.registry.active_count() < min_workers {
            tokio::select! {
                biased;

                _ = rx.shutdown.recv() => {
                    self.set_state(RunState::Cancelled);
                    return Ok(Some(RunState::Cancelled));
                }
                event = rx.events.recv() => {
                    let event = event.ok_or_else(|| Error::ChannelClosed {
                        channel: "coordinator events".to_string(),
                    })?;
                    self.handle_event(event)?;
                }
                _ = &mut expired => {
                    let connected = shared.registry.active_count();
                    warn!(expected = min_workers, connected, "Timed out waiting for workers");
                    return Err(Error::MountTimeout {
                        expected: min_workers,
                        connected,
                        timeout_ms: mount_timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                    });
                }
            }
            self.drain_losses(rx)?;
        }

        info!(workers = shared.registry.active_count(), "Workers mounted");
        Ok(None)
    }

    fn finished(&self) -> Option<RunState> {
        let shared = &self.handle.shared;
        if shared.config.exit_when_drained && shared.queue.is_drained() {
            self.set_state(RunState::Complete);
            return Some(RunState::Complete);
        }
        None
    }

    fn handle_event(&self, event: WorkerEvent) -> Result<()> {
        let shared = &self.handle.shared;
        match event {
            WorkerEvent::Connect {
                worker_id,
                hostname,
                link,
                reply,
            } => {
                let worker_id = worker_id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let result = shared
                    .registry
                    .register(WorkerInfo::new(worker_id.clone(), hostname), link);
                let registered = result.is_ok();
                if let Err(e) = &result {
                    warn!(worker_id = %worker_id, error = %e, "Worker handshake rejected");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                if registered {
                    self.dispatch()?;
                }
            }

            WorkerEvent::Connection(event) => self.handle_connection(event)?,

            WorkerEvent::JobResult {
                worker_id,
                job_id,
                result,
            } => self.handle_result(worker_id, job_id, result)?,

            WorkerEvent::Departed { worker_id } => match shared.registry.deregister(&worker_id) {
                Ok(info) => {
                    let reclaim = shared.allocator.reclaim(info.assigned_jobs)?;
                    self.record(reclaim.failed);
                    let lost = self.lost_worker_count();
                    if lost > 0 {
                        self.apply_loss_policy(lost)?;
                    }
                    self.dispatch()?;
                }
                Err(_) => debug!(worker_id = %worker_id, "Departure from unknown worker"),
            },

            WorkerEvent::JobsSubmitted => self.dispatch()?,
        }
        Ok(())
    }

    fn handle_connection(&self, event: ConnectionEvent) -> Result<()> {
        let shared = &self.handle.shared;
        let worker_id = event.worker_id.clone();
        let rejoin_link = match &event.kind {
            ConnectionEventKind::Reconnected { link } => Some(link.clone()),
            _ => None,
        };

        match shared.detector.observe(event) {
            Verdict::Healthy => self.dispatch()?,
            Verdict::Transient => {}
            Verdict::Recovered { held } => {
                if let Err(e) = shared.allocator.redeliver(&worker_id, &held) {
                    warn!(worker_id = %worker_id, error = %e, "Redelivery failed");
                }
                self.dispatch()?;
            }
            Verdict::Lost { jobs } => {
                // Reclaimed when the loss event is drained
                debug!(worker_id = %worker_id, held = jobs.len(), "Loss confirmed by detector");
            }
            Verdict::Unknown => {
                if let Some(link) = rejoin_link {
                    let _ = link.send(WorkerCommand::Shutdown {
                        reason: format!("worker {worker_id} is not registered"),
                    });
                }
            }
        }
        Ok(())
    }

    fn handle_result(&self, worker_id: WorkerId, job_id: JobId, result: JobResult) -> Result<()> {
        let shared = &self.handle.shared;
        if !shared.registry.release_job(&worker_id, job_id) {
            warn!(worker_id = %worker_id, job_id, "Ignoring result for a job the worker does not hold");
            return Ok(());
        }

        match result {
            JobResult::Success(payload) => {
                let job = shared.queue.complete(job_id)?;
                debug!(worker_id = %worker_id, job_id, "Job complete");
                self.record([JobOutcome {
                    job_id,
                    worker_id: Some(worker_id),
                    attempts: job.attempts,
                    result: JobResult::Success(payload),
                    finished_at: Utc::now(),
                }]);
            }
            JobResult::Failure(reason) => match shared.config.job_failure_policy {
                JobFailurePolicy::Fail => {
                    let job = shared.queue.fail_terminal(job_id)?;
                    warn!(worker_id = %worker_id, job_id, reason = %reason, "Job failed");
                    self.record([JobOutcome {
                        job_id,
                        worker_id: Some(worker_id),
                        attempts: job.attempts,
                        result: JobResult::Failure(reason),
                        finished_at: Utc::now(),
                    }]);
                }
                JobFailurePolicy::Retry => {
                    info!(worker_id = %worker_id, job_id, reason = %reason, "Job failed, retrying");
                    let reclaim = shared.allocator.reclaim([job_id])?;
                    self.record(reclaim.failed);
                }
            },
        }

        self.dispatch()
    }

    fn drain_losses(&self, rx: &mut Receivers) -> Result<()> {
        while let Ok(loss) = rx.losses.try_recv() {
            self.handle_loss(loss)?;
        }
        Ok(())
    }

    /// Reclaim the lost worker's jobs, count the loss, then apply the policy
    fn handle_loss(&self, loss: LossEvent) -> Result<()> {
        let shared = &self.handle.shared;
        let reclaim = shared.allocator.reclaim(loss.jobs.iter().copied())?;
        self.record(reclaim.failed);

        let lost = shared.lost_worker_count.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            worker_id = %loss.worker_id,
            lost_worker_count = lost,
            max_worker_loss = shared.config.max_worker_loss,
            requeued = reclaim.requeued.len(),
            "Worker lost"
        );

        self.apply_loss_policy(lost)?;
        self.dispatch()
    }

    fn apply_loss_policy(&self, lost: u64) -> Result<()> {
        let shared = &self.handle.shared;
        let max_worker_loss = shared.config.max_worker_loss;

        if lost > max_worker_loss {
            self.set_state(RunState::FatalMaxLoss);
            return Err(Error::MaxWorkerLoss {
                lost_worker_count: lost,
                max_worker_loss,
                unfinished: shared.queue.unfinished_ids(),
            });
        }

        if shared.config.no_worker_kill && shared.registry.active_count() == 0 {
            self.set_state(RunState::FatalNoWorkers);
            return Err(Error::NoWorkersFound {
                lost_worker_count: lost,
                max_worker_loss,
                unfinished: shared.queue.unfinished_ids(),
            });
        }

        Ok(())
    }

    fn dispatch(&self) -> Result<()> {
        if self.state() != RunState::Running {
            return Ok(());
        }
        let dispatched = self.handle.shared.allocator.dispatch()?;
        if !dispatched.is_empty() {
            debug!(count = dispatched.len(), "Dispatch round finished");
        }
        Ok(())
    }

    fn record<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = JobOutcome>,
    {
        let shared = &self.handle.shared;
        let mut results = shared.results.lock();
        results.extend(outcomes);

        let Some(cap) = shared.config.max_buffered_results else {
            return;
        };
        if results.len() > cap {
            let excess = results.len() - cap;
            results.drain(..excess);
            let excess = excess as u64;
            let dropped = shared.results_dropped.fetch_add(excess, Ordering::SeqCst) + excess;
            warn!(dropped, cap, "Result buffer full, oldest outcomes discarded");
        }
    }

    fn check_invariants(&self) -> Result<()> {
        let shared = &self.handle.shared;
        let registered = shared.registry.registered_total();
        let accounted = self.lost_worker_count()
            + shared.registry.departed_total()
            + shared.registry.active_count() as u64;
        if registered != accounted {
            return Err(Error::internal(format!(
                "worker accounting mismatch: {registered} registered, {accounted} active, lost or departed"
            )));
        }

        let held = shared.registry.assigned_job_count();
        let assigned = shared.queue.assigned_len();
        if held != assigned {
            return Err(Error::internal(format!(
                "{held} jobs held by workers but {assigned} assigned in the queue"
            )));
        }
        Ok(())
    }

    fn set_state(&self, state: RunState) {
        let mut current = self.handle.shared.state.write();
        if *current != state {
            info!(from = ?*current, to = ?state, "Coordinator state changed");
            *current = state;
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").field("handle", &self.handle).finish()
    }
}

/// Builder for Coordinator
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of lost workers tolerated
    pub fn max_worker_loss(mut self, max: u64) -> Self {
        self.config.max_worker_loss = max;
        self
    }

    /// Abort when every worker is gone
    pub fn no_worker_kill(mut self, enabled: bool) -> Self {
        self.config.no_worker_kill = enabled;
        self
    }

    /// Set jobs held per worker
    pub fn jobs_per_worker(mut self, jobs: usize) -> Self {
        self.config.jobs_per_worker = jobs;
        self
    }

    /// Set workers to wait for before dispatching
    pub fn min_workers(mut self, workers: usize) -> Self {
        self.config.min_workers = workers;
        self
    }

    /// Set the mount timeout
    pub fn mount_timeout(mut self, timeout: Duration) -> Self {
        self.config.mount_timeout = Some(timeout);
        self
    }

    /// Keep at most `count` undrained outcomes
    pub fn max_buffered_results(mut self, count: usize) -> Self {
        self.config.max_buffered_results = Some(count);
        self
    }

    /// Cap the attempts of a reclaimed job
    pub fn max_job_attempts(mut self, attempts: u32) -> Self {
        self.config.max_job_attempts = Some(attempts);
        self
    }

    /// Set the handling of job failures
    pub fn job_failure_policy(mut self, policy: JobFailurePolicy) -> Self {
        self.config.job_failure_policy = policy;
        self
    }

    /// Keep running after the queue drains
    pub fn serve(mut self) -> Self {
        self.config.exit_when_drained = false;
        self
    }

    /// Build the coordinator
    pub fn build(self) -> Result<Coordinator> {
        Coordinator::new(self.config)
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
