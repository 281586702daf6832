//! Error types for the job farming core

use thiserror::Error;

use crate::types::JobId;

/// Result type alias using the farm Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the job farming coordinator
#[derive(Error, Debug)]
pub enum Error {
    // Worker errors
    #[error("Worker not found: {worker_id}")]
    WorkerNotFound { worker_id: String },

    #[error("Worker already registered: {worker_id}")]
    DuplicateWorker { worker_id: String },

    // Loss policy errors
    #[error(
        "Maximum number of lost workers surpassed: {lost_worker_count} lost \
         (max_worker_loss = {max_worker_loss}, {} jobs unfinished)",
        .unfinished.len()
    )]
    MaxWorkerLoss {
        lost_worker_count: u64,
        max_worker_loss: u64,
        unfinished: Vec<JobId>,
    },

    #[error(
        "All workers have been lost: {lost_worker_count} lost \
         (max_worker_loss = {max_worker_loss}, {} jobs unfinished)",
        .unfinished.len()
    )]
    NoWorkersFound {
        lost_worker_count: u64,
        max_worker_loss: u64,
        unfinished: Vec<JobId>,
    },

    #[error("Timed out waiting for workers: {connected}/{expected} connected after {timeout_ms}ms")]
    MountTimeout {
        expected: usize,
        connected: usize,
        timeout_ms: u64,
    },

    // Job errors
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Broken invariants
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::MountTimeout { .. })
    }

    /// Returns true if this error terminates the run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MaxWorkerLoss { .. }
                | Error::NoWorkersFound { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Jobs left unfinished when a loss policy aborted the run
    pub fn unfinished_jobs(&self) -> Option<&[JobId]> {
        match self {
            Error::MaxWorkerLoss { unfinished, .. } | Error::NoWorkersFound { unfinished, .. } => {
                Some(unfinished)
            }
            _ => None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
