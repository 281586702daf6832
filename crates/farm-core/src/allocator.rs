//! Job allocation and reallocation

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::queue::JobQueue;
use crate::worker::{AssignAttempt, WorkerRegistryHandle};
use crate::{JobAssignment, JobId, JobOutcome, JobResult, Result, WorkerCommand, WorkerId};

/// What happened to a batch of reclaimed jobs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reclaim {
    /// Jobs put back at the tail of the queue, ascending
    pub requeued: Vec<JobId>,

    /// Jobs that hit the attempt cap and were failed instead
    pub failed: Vec<JobOutcome>,
}

impl Reclaim {
    /// Jobs handled in total
    pub fn len(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Moves jobs between the queue and the workers
#[derive(Debug, Clone)]
pub struct Allocator {
    registry: WorkerRegistryHandle,
    queue: Arc<JobQueue>,
    capacity: usize,
    max_job_attempts: Option<u32>,
}

impl Allocator {
    /// Create an allocator sized by `config`
    pub fn new(registry: WorkerRegistryHandle, queue: Arc<JobQueue>, config: &CoordinatorConfig) -> Self {
        Self {
            registry,
            queue,
            capacity: config.jobs_per_worker,
            max_job_attempts: config.max_job_attempts,
        }
    }

    /// Hand pending jobs to idle workers until one side runs out.
    ///
    /// Each job is popped and confirmed while the receiving worker's entry
    /// is locked, so a concurrent loss either reclaims it or never sees it.
    pub fn dispatch(&self) -> Result<Vec<(WorkerId, JobAssignment)>> {
        let mut dispatched = Vec::new();
        let mut misses = 0;

        while let Some(worker_id) = self.registry.next_idle_worker(self.capacity) {
            let attempt = self.registry.try_assign(&worker_id, self.capacity, |holder| {
                match self.queue.next_pending() {
                    Some(job) => self.queue.confirm_assigned(job.id, holder).map(Some),
                    None => Ok(None),
                }
            })?;

            match attempt {
                AssignAttempt::Assigned(assignment) => {
                    debug!(
                        worker_id = %worker_id,
                        job_id = assignment.job_id,
                        attempt = assignment.attempt,
                        "Job dispatched"
                    );
                    dispatched.push((worker_id, assignment));
                }
                AssignAttempt::NoJob => break,
                AssignAttempt::WorkerUnavailable => {
                    // Worker vanished between selection and locking
                    misses += 1;
                    if misses > self.registry.active_count() {
                        break;
                    }
                }
            }
        }

        Ok(dispatched)
    }

    /// Put assigned jobs back at the tail of the queue in ascending order.
    ///
    /// With `max_job_attempts` set, jobs that already used up their attempts
    /// are failed for good and returned as outcomes instead.
    pub fn reclaim<I>(&self, job_ids: I) -> Result<Reclaim>
    where
        I: IntoIterator<Item = JobId>,
    {
        let mut ids: Vec<JobId> = job_ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut reclaim = Reclaim::default();
        for job_id in ids {
            let exhausted = match (self.max_job_attempts, self.queue.get(job_id)) {
                (Some(cap), Some(job)) => job.attempts >= cap,
                _ => false,
            };
            if exhausted {
                let job = self.queue.fail_terminal(job_id)?;
                warn!(job_id, attempts = job.attempts, "Job abandoned after reaching attempt cap");
                reclaim.failed.push(JobOutcome {
                    job_id,
                    worker_id: job.assigned_worker,
                    attempts: job.attempts,
                    result: JobResult::Failure(format!(
                        "abandoned after {} attempts",
                        job.attempts
                    )),
                    finished_at: Utc::now(),
                });
            } else {
                reclaim.requeued.push(job_id);
            }
        }

        self.queue.requeue(reclaim.requeued.iter().copied())?;
        if !reclaim.is_empty() {
            info!(
                requeued = reclaim.requeued.len(),
                failed = reclaim.failed.len(),
                "Jobs reclaimed"
            );
        }
        Ok(reclaim)
    }

    /// Reclaim jobs from a lost worker and hand them to the survivors
    pub fn reallocate<I>(&self, job_ids: I) -> Result<Reclaim>
    where
        I: IntoIterator<Item = JobId>,
    {
        let reclaim = self.reclaim(job_ids)?;
        self.dispatch()?;
        Ok(reclaim)
    }

    /// Resend the jobs a reconnected worker still holds.
    ///
    /// Attempts are not bumped: the worker never lost ownership.
    pub fn redeliver<'a, I>(&self, worker_id: &str, held: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a JobId>,
    {
        let mut sent = 0;
        for &job_id in held {
            let Some(job) = self.queue.get(job_id) else {
                continue;
            };
            self.registry
                .send(worker_id, WorkerCommand::Run(job.assignment()))?;
            sent += 1;
        }
        if sent > 0 {
            info!(worker_id = %worker_id, count = sent, "Jobs redelivered after reconnect");
        }
        Ok(sent)
    }

    /// Capacity of each worker
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
