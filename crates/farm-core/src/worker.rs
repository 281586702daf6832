//! Worker state and registry management

use crate::{Error, Job, JobAssignment, JobId, Result, WorkerCommand, WorkerId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound half of a worker connection.
///
/// Implementations must not block: a send either queues the command on the
/// transport or fails immediately.
pub trait WorkerLink: Send + Sync {
    /// Queue a command for delivery to the worker
    fn send(&self, command: WorkerCommand) -> Result<()>;
}

/// Worker link backed by an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl ChannelLink {
    /// Create a link and the receiver the worker side reads from
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl WorkerLink for ChannelLink {
    fn send(&self, command: WorkerCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::ChannelClosed {
            channel: "worker link".to_string(),
        })
    }
}

/// Worker health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerHealth {
    /// Worker is usable
    Active,

    /// Worker failed permanently
    Lost,
}

/// State of the transport connection underneath an active worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkState {
    /// Commands are being delivered
    Connected,

    /// Transport is retrying; no new work is sent
    Reconnecting,
}

/// Worker information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique worker identifier
    pub id: WorkerId,

    /// Worker hostname
    pub hostname: String,

    /// Current health
    pub health: WorkerHealth,

    /// Current connection state
    pub link_state: LinkState,

    /// Jobs currently held by this worker
    pub assigned_jobs: BTreeSet<JobId>,

    /// Registration timestamp
    pub registered_at: DateTime<Utc>,

    /// Jobs this worker has reported back
    pub jobs_finished: u64,

    /// Dispatch sequence of the last job handed to this worker
    pub last_dispatch: u64,
}

impl WorkerInfo {
    /// Create a new worker info
    pub fn new(id: WorkerId, hostname: String) -> Self {
        Self {
            id,
            hostname,
            health: WorkerHealth::Active,
            link_state: LinkState::Connected,
            assigned_jobs: BTreeSet::new(),
            registered_at: Utc::now(),
            jobs_finished: 0,
            last_dispatch: 0,
        }
    }

    /// Check if the worker can take another job
    pub fn is_idle(&self, capacity: usize) -> bool {
        self.health == WorkerHealth::Active
            && self.link_state == LinkState::Connected
            && self.assigned_jobs.len() < capacity
    }
}

/// Emitted exactly once when a worker transitions to lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossEvent {
    /// Worker that was lost
    pub worker_id: WorkerId,

    /// Jobs the worker held at the time of loss
    pub jobs: BTreeSet<JobId>,

    /// When the loss was recorded
    pub lost_at: DateTime<Utc>,
}

/// Outcome of trying to hand a job to a specific worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignAttempt {
    /// Job is now held by the worker
    Assigned(JobAssignment),

    /// Worker is gone, full or reconnecting
    WorkerUnavailable,

    /// No job was available
    NoJob,
}

struct WorkerEntry {
    info: WorkerInfo,
    link: Arc<dyn WorkerLink>,
}

/// Thread-safe worker registry
pub struct WorkerRegistry {
    /// Map of worker ID to worker entry
    workers: DashMap<WorkerId, WorkerEntry>,

    /// Maximum workers allowed
    max_workers: usize,

    /// Workers ever registered
    registered_total: AtomicU64,

    /// Workers that left gracefully
    departed_total: AtomicU64,

    /// Counter ordering dispatches for round-robin selection
    dispatch_seq: AtomicU64,

    /// Jobs held across all workers
    held_jobs: AtomicUsize,

    /// Loss notifications for the coordinator
    loss_tx: Option<mpsc::UnboundedSender<LossEvent>>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.workers.len())
            .field("max_workers", &self.max_workers)
            .field("registered_total", &self.registered_total())
            .finish()
    }
}

impl WorkerRegistry {
    /// Create a new worker registry
    pub fn new(max_workers: usize) -> Self {
        Self {
            workers: DashMap::new(),
            max_workers,
            registered_total: AtomicU64::new(0),
            departed_total: AtomicU64::new(0),
            dispatch_seq: AtomicU64::new(0),
            held_jobs: AtomicUsize::new(0),
            loss_tx: None,
        }
    }

    /// Create a registry that reports every loss on `loss_tx`
    pub fn with_loss_channel(max_workers: usize, loss_tx: mpsc::UnboundedSender<LossEvent>) -> Self {
        Self {
            loss_tx: Some(loss_tx),
            ..Self::new(max_workers)
        }
    }

    /// Register a new worker
    pub fn register(&self, worker: WorkerInfo, link: Arc<dyn WorkerLink>) -> Result<WorkerId> {
        if self.workers.contains_key(&worker.id) {
            return Err(Error::DuplicateWorker {
                worker_id: worker.id,
            });
        }
        if self.workers.len() >= self.max_workers {
            return Err(Error::InvalidConfig {
                message: format!("Maximum workers ({}) reached", self.max_workers),
            });
        }

        match self.workers.entry(worker.id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateWorker {
                worker_id: worker.id,
            }),
            Entry::Vacant(slot) => {
                let worker_id = worker.id.clone();
                info!(
                    worker_id = %worker_id,
                    hostname = %worker.hostname,
                    "Worker registered"
                );
                self.held_jobs
                    .fetch_add(worker.assigned_jobs.len(), Ordering::SeqCst);
                slot.insert(WorkerEntry { info: worker, link });
                self.registered_total.fetch_add(1, Ordering::SeqCst);
                Ok(worker_id)
            }
        }
    }

    /// Transition a worker to lost and hand back the jobs it held.
    ///
    /// The entry is removed atomically, so the returned set is authoritative
    /// and produced once. Later calls for the same id return an empty set.
    pub fn mark_lost(&self, worker_id: &str) -> BTreeSet<JobId> {
        let Some((_, mut entry)) = self.workers.remove(worker_id) else {
            debug!(worker_id = %worker_id, "Loss reported for unknown worker, ignoring");
            return BTreeSet::new();
        };

        entry.info.health = WorkerHealth::Lost;
        let jobs = std::mem::take(&mut entry.info.assigned_jobs);
        self.held_jobs.fetch_sub(jobs.len(), Ordering::SeqCst);

        warn!(
            worker_id = %worker_id,
            reclaimed = jobs.len(),
            "Worker marked as lost"
        );

        if let Some(tx) = &self.loss_tx {
            let event = LossEvent {
                worker_id: worker_id.to_string(),
                jobs: jobs.clone(),
                lost_at: Utc::now(),
            };
            if tx.send(event).is_err() {
                warn!(worker_id = %worker_id, "Loss channel closed, event dropped");
            }
        }

        jobs
    }

    /// Remove a worker that is leaving on its own, returning its final state
    pub fn deregister(&self, worker_id: &str) -> Result<WorkerInfo> {
        self.workers
            .remove(worker_id)
            .map(|(_, entry)| {
                self.departed_total.fetch_add(1, Ordering::SeqCst);
                self.held_jobs
                    .fetch_sub(entry.info.assigned_jobs.len(), Ordering::SeqCst);
                info!(worker_id = %worker_id, "Worker deregistered");
                entry.info
            })
            .ok_or_else(|| Error::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })
    }

    /// Get worker info by ID
    pub fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.get(worker_id).map(|w| w.info.clone())
    }

    /// Check whether a worker is registered and active
    pub fn is_active(&self, worker_id: &str) -> bool {
        self.workers
            .get(worker_id)
            .map(|w| w.info.health == WorkerHealth::Active)
            .unwrap_or(false)
    }

    /// Number of active workers
    pub fn active_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|entry| entry.value().info.health == WorkerHealth::Active)
            .count()
    }

    /// Get all workers, ordered by id
    pub fn all_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<_> = self
            .workers
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Workers ever registered
    pub fn registered_total(&self) -> u64 {
        self.registered_total.load(Ordering::SeqCst)
    }

    /// Workers that left gracefully
    pub fn departed_total(&self) -> u64 {
        self.departed_total.load(Ordering::SeqCst)
    }

    /// Total jobs held across all workers
    pub fn assigned_job_count(&self) -> usize {
        self.held_jobs.load(Ordering::SeqCst)
    }

    /// Update the transport state of a worker
    pub fn set_link_state(&self, worker_id: &str, state: LinkState) -> Result<()> {
        let mut entry = self.entry_mut(worker_id)?;
        if entry.info.link_state != state {
            debug!(worker_id = %worker_id, state = ?state, "Worker link state changed");
            entry.info.link_state = state;
        }
        Ok(())
    }

    /// Swap in a new link after a reconnect, returning the jobs still held
    pub fn replace_link(&self, worker_id: &str, link: Arc<dyn WorkerLink>) -> Result<BTreeSet<JobId>> {
        let mut entry = self.entry_mut(worker_id)?;
        entry.link = link;
        entry.info.link_state = LinkState::Connected;
        info!(
            worker_id = %worker_id,
            held = entry.info.assigned_jobs.len(),
            "Worker reconnected"
        );
        Ok(entry.info.assigned_jobs.clone())
    }

    /// Pick the idle worker that should receive the next job.
    ///
    /// Prefers the fewest held jobs, then the least recently dispatched,
    /// which spreads work round-robin over time.
    pub fn next_idle_worker(&self, capacity: usize) -> Option<WorkerId> {
        self.workers
            .iter()
            .filter(|entry| entry.value().info.is_idle(capacity))
            .map(|entry| {
                let info = &entry.value().info;
                (info.assigned_jobs.len(), info.last_dispatch, info.id.clone())
            })
            .min()
            .map(|(_, _, id)| id)
    }

    /// Hand a job to `worker_id` while holding its entry.
    ///
    /// `take_job` runs under the worker's lock, so a concurrent `mark_lost`
    /// either sees the new job in the returned set or removes the worker
    /// before any job is taken.
    pub fn try_assign<F>(&self, worker_id: &str, capacity: usize, take_job: F) -> Result<AssignAttempt>
    where
        F: FnOnce(&WorkerId) -> Result<Option<Job>>,
    {
        let Some(mut entry) = self.workers.get_mut(worker_id) else {
            return Ok(AssignAttempt::WorkerUnavailable);
        };
        if !entry.info.is_idle(capacity) {
            return Ok(AssignAttempt::WorkerUnavailable);
        }

        let Some(job) = take_job(&entry.info.id)? else {
            return Ok(AssignAttempt::NoJob);
        };

        if !entry.info.assigned_jobs.insert(job.id) {
            return Err(Error::internal(format!(
                "job {} already held by worker {}",
                job.id, worker_id
            )));
        }
        self.held_jobs.fetch_add(1, Ordering::SeqCst);
        entry.info.last_dispatch = self.dispatch_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let assignment = job.assignment();
        if let Err(e) = entry.link.send(WorkerCommand::Run(assignment.clone())) {
            // The job stays held; a reconnect redelivers it and a loss reclaims it.
            warn!(worker_id = %worker_id, job_id = job.id, error = %e, "Failed to deliver job");
        }

        Ok(AssignAttempt::Assigned(assignment))
    }

    /// Check whether a worker currently holds a job
    pub fn holds_job(&self, worker_id: &str, job_id: JobId) -> bool {
        self.workers
            .get(worker_id)
            .map(|w| w.info.assigned_jobs.contains(&job_id))
            .unwrap_or(false)
    }

    /// Drop a finished job from a worker's held set
    pub fn release_job(&self, worker_id: &str, job_id: JobId) -> bool {
        let Some(mut entry) = self.workers.get_mut(worker_id) else {
            return false;
        };
        let released = entry.info.assigned_jobs.remove(&job_id);
        if released {
            entry.info.jobs_finished += 1;
            self.held_jobs.fetch_sub(1, Ordering::SeqCst);
        }
        released
    }

    /// Send a command to one worker
    pub fn send(&self, worker_id: &str, command: WorkerCommand) -> Result<()> {
        let entry = self.workers.get(worker_id).ok_or_else(|| Error::WorkerNotFound {
            worker_id: worker_id.to_string(),
        })?;
        entry.link.send(command)
    }

    /// Send a command to every registered worker, returning how many accepted it
    pub fn broadcast(&self, command: &WorkerCommand) -> usize {
        self.workers
            .iter()
            .filter(|entry| match entry.value().link.send(command.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(worker_id = %entry.key(), error = %e, "Failed to send command");
                    false
                }
            })
            .count()
    }

    fn entry_mut(
        &self,
        worker_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, WorkerId, WorkerEntry>> {
        self.workers.get_mut(worker_id).ok_or_else(|| Error::WorkerNotFound {
            worker_id: worker_id.to_string(),
        })
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(10000)
    }
}

/// Thread-safe handle to worker registry
pub type WorkerRegistryHandle = Arc<WorkerRegistry>;
