//! FIFO job queue with reservation and tail requeue
//!
//! Jobs are handed out in submission order. Jobs reclaimed from a lost
//! worker go to the back of the line so a job that keeps killing workers
//! cannot monopolise the head of the queue.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{Error, Job, JobId, JobStatus, Result, WorkerId};

#[derive(Debug, Default)]
struct QueueInner {
    /// Every job that has not left the queue
    jobs: HashMap<JobId, Job>,

    /// Pending job ids in dispatch order
    pending: VecDeque<JobId>,

    /// Last id handed out
    last_id: JobId,

    // Kept in step with `jobs` on every status change
    reserved: usize,
    assigned: usize,

    completed: u64,
    failed: u64,
}

impl QueueInner {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&job_id).ok_or(Error::JobNotFound { job_id })
    }

    /// Move a job to `to`, keeping the counters in step
    fn set_status(&mut self, job_id: JobId, to: JobStatus) -> Result<&mut Job> {
        let job = self.jobs.get_mut(&job_id).ok_or(Error::JobNotFound { job_id })?;
        let from = std::mem::replace(&mut job.status, to);
        self.untrack(from);
        self.track(to);
        self.job_mut(job_id)
    }

    /// Take a job out of the queue for good
    fn remove(&mut self, job_id: JobId) -> Result<Job> {
        let job = self.jobs.remove(&job_id).ok_or(Error::JobNotFound { job_id })?;
        self.untrack(job.status);
        Ok(job)
    }

    fn track(&mut self, status: JobStatus) {
        match status {
            JobStatus::Reserved => self.reserved += 1,
            JobStatus::Assigned => self.assigned += 1,
            _ => {}
        }
    }

    fn untrack(&mut self, status: JobStatus) {
        match status {
            JobStatus::Reserved => self.reserved -= 1,
            JobStatus::Assigned => self.assigned -= 1,
            _ => {}
        }
    }
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub reserved: usize,
    pub assigned: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Thread-safe job queue
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job at the back of the queue
    pub fn submit(&self, payload: Bytes) -> JobId {
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let id = inner.last_id;
        inner.jobs.insert(id, Job::new(id, payload));
        inner.pending.push_back(id);
        debug!(job_id = id, "Job submitted");
        id
    }

    /// Add several jobs, preserving their order
    pub fn submit_batch<I>(&self, payloads: I) -> Vec<JobId>
    where
        I: IntoIterator<Item = Bytes>,
    {
        payloads.into_iter().map(|p| self.submit(p)).collect()
    }

    /// Pop the oldest pending job and reserve it for the caller.
    ///
    /// Ids whose job is no longer pending are dropped from the line.
    pub fn next_pending(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        while let Some(id) = inner.pending.pop_front() {
            match inner.jobs.get(&id).map(|job| job.status) {
                Some(JobStatus::Pending) => {
                    let job = inner.set_status(id, JobStatus::Reserved).ok()?;
                    return Some(job.clone());
                }
                status => warn!(job_id = id, ?status, "Skipping stale pending entry"),
            }
        }
        None
    }

    /// Return a reserved job to the head of the queue, it never ran
    pub fn release(&self, job_id: JobId) -> Result<()> {
        let mut inner = self.inner.lock();
        let status = inner.job_mut(job_id)?.status;
        if status != JobStatus::Reserved {
            return Err(Error::internal(format!(
                "cannot release job {job_id} in state {status:?}"
            )));
        }
        inner.set_status(job_id, JobStatus::Pending)?;
        inner.pending.push_front(job_id);
        Ok(())
    }

    /// Confirm a reserved job as held by `worker_id`, counting the attempt
    pub fn confirm_assigned(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Job> {
        let mut inner = self.inner.lock();
        let status = inner.job_mut(job_id)?.status;
        if status != JobStatus::Reserved {
            return Err(Error::internal(format!(
                "cannot assign job {job_id} in state {status:?}"
            )));
        }
        let job = inner.set_status(job_id, JobStatus::Assigned)?;
        job.assigned_worker = Some(worker_id.clone());
        job.attempts += 1;
        Ok(job.clone())
    }

    /// Move assigned jobs back to pending, behind everything already waiting.
    ///
    /// Every id must name an assigned job and appear once; otherwise nothing
    /// is moved.
    pub fn requeue<I>(&self, job_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = JobId>,
    {
        let job_ids: Vec<JobId> = job_ids.into_iter().collect();
        let mut inner = self.inner.lock();

        let mut seen = HashSet::with_capacity(job_ids.len());
        for &job_id in &job_ids {
            if !seen.insert(job_id) {
                return Err(Error::internal(format!(
                    "job {job_id} listed twice for requeue"
                )));
            }
            let job = inner.jobs.get(&job_id).ok_or(Error::JobNotFound { job_id })?;
            if job.status != JobStatus::Assigned {
                return Err(Error::internal(format!(
                    "cannot requeue job {job_id} in state {:?}",
                    job.status
                )));
            }
        }

        for &job_id in &job_ids {
            inner.set_status(job_id, JobStatus::Pending)?.assigned_worker = None;
            inner.pending.push_back(job_id);
        }

        if !job_ids.is_empty() {
            debug!(count = job_ids.len(), "Jobs requeued at tail");
        }
        Ok(job_ids.len())
    }

    /// Remove a finished job from the queue
    pub fn complete(&self, job_id: JobId) -> Result<Job> {
        let mut inner = self.inner.lock();
        let status = inner.job_mut(job_id)?.status;
        if status != JobStatus::Assigned {
            return Err(Error::internal(format!(
                "cannot complete job {job_id} in state {status:?}"
            )));
        }
        let mut job = inner.remove(job_id)?;
        job.status = JobStatus::Complete;
        inner.completed += 1;
        Ok(job)
    }

    /// Give up on a job for good
    pub fn fail_terminal(&self, job_id: JobId) -> Result<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner.remove(job_id)?;
        if job.status == JobStatus::Pending {
            inner.pending.retain(|id| *id != job_id);
        }
        job.status = JobStatus::FailedTerminal;
        inner.failed += 1;
        Ok(job)
    }

    /// Get a copy of a job still in the queue
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().jobs.get(&job_id).cloned()
    }

    /// Pending job ids in dispatch order
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.inner.lock().pending.iter().copied().collect()
    }

    /// Ids of every job without an outcome, ascending
    pub fn unfinished_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self.inner.lock().jobs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Copies of every job still in the queue, ascending by id
    pub fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<_> = self.inner.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Number of pending jobs
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of assigned jobs
    pub fn assigned_len(&self) -> usize {
        self.inner.lock().assigned
    }

    /// Jobs that have not left the queue
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Returns true if no job is waiting, reserved or assigned
    pub fn is_drained(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }

    /// Alias of `is_drained`
    pub fn is_empty(&self) -> bool {
        self.is_drained()
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.pending.len(),
            reserved: inner.reserved,
            assigned: inner.assigned,
            completed: inner.completed,
            failed: inner.failed,
        }
    }
}
