//! Core type definitions for the job farm

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier types
pub type WorkerId = String;
pub type JobId = u64;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting in the queue for a worker
    Pending,

    /// Popped from the queue, not yet confirmed to a worker
    Reserved,

    /// Held by exactly one worker
    Assigned,

    /// Finished successfully
    Complete,

    /// Given up on, will not be attempted again
    FailedTerminal,
}

impl JobStatus {
    /// Returns true once the job has left the queue for good
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::FailedTerminal)
    }
}

/// A unit of work tracked by the job queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, increasing in submission order
    pub id: JobId,

    /// Opaque payload handed to the worker
    pub payload: Bytes,

    /// Current status
    pub status: JobStatus,

    /// Worker holding the job, only set while assigned
    pub assigned_worker: Option<WorkerId>,

    /// Number of times the job has been handed to a worker
    pub attempts: u32,

    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job
    pub fn new(id: JobId, payload: Bytes) -> Self {
        Self {
            id,
            payload,
            status: JobStatus::Pending,
            assigned_worker: None,
            attempts: 0,
            submitted_at: Utc::now(),
        }
    }

    /// Build the message sent to the worker for the current attempt
    pub fn assignment(&self) -> JobAssignment {
        JobAssignment {
            job_id: self.id,
            payload: self.payload.clone(),
            attempt: self.attempts,
        }
    }
}

/// Job handed to a worker over its link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: JobId,
    pub payload: Bytes,
    pub attempt: u32,
}

/// Commands the coordinator sends down a worker link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Execute a job and report its result
    Run(JobAssignment),

    /// Stop working and close the connection
    Shutdown { reason: String },
}

/// Result reported by a worker for a single job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    /// The job ran to completion
    Success(Bytes),

    /// The job failed while the worker itself survived
    Failure(String),
}

/// Final record of a job that left the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job identifier
    pub job_id: JobId,

    /// Worker that produced the outcome, if any
    pub worker_id: Option<WorkerId>,

    /// Attempts made before the job left the queue
    pub attempts: u32,

    /// Success payload or failure reason
    pub result: JobResult,

    /// When the outcome was recorded
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    /// Returns true if the job succeeded
    pub fn is_success(&self) -> bool {
        matches!(self.result, JobResult::Success(_))
    }
}
