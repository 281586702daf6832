//! Farm configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Main farm configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Allocation and loss policy settings
    pub coordinator: CoordinatorConfig,

    /// Network settings for the transport adapters
    pub server: ServerSettings,
}

impl FarmConfig {
    /// Load a configuration from a JSON file, missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: FarmConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()
    }
}

/// What to do with a job whose worker reports a failure
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobFailurePolicy {
    /// Record the failure as the job's outcome
    #[default]
    Fail,

    /// Put the job back at the tail of the queue
    Retry,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lost workers tolerated before the run is aborted
    pub max_worker_loss: u64,

    /// Abort when every worker is gone, even below `max_worker_loss`
    pub no_worker_kill: bool,

    /// Jobs a single worker may hold at once
    pub jobs_per_worker: usize,

    /// Workers to wait for before the first dispatch
    pub min_workers: usize,

    /// Give up waiting for `min_workers` after this long
    #[serde(with = "humantime_serde::option")]
    pub mount_timeout: Option<Duration>,

    /// Attempts after which a reclaimed job is failed instead of requeued
    pub max_job_attempts: Option<u32>,

    /// Handling of failures reported by a surviving worker
    pub job_failure_policy: JobFailurePolicy,

    /// Finish `run()` once every job has an outcome
    pub exit_when_drained: bool,

    /// Maximum number of registered workers
    pub max_workers: usize,

    /// Outcomes kept until `take_results`; the oldest are dropped beyond
    /// this. Unbounded when unset.
    pub max_buffered_results: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_worker_loss: 2,
            no_worker_kill: true,
            jobs_per_worker: 1,
            min_workers: 1,
            mount_timeout: None,
            max_job_attempts: None,
            job_failure_policy: JobFailurePolicy::Fail,
            exit_when_drained: true,
            max_workers: 10000,
            max_buffered_results: None,
        }
    }
}

impl CoordinatorConfig {
    /// Check the configuration for values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.jobs_per_worker == 0 {
            return Err(Error::InvalidConfig {
                message: "jobs_per_worker must be at least 1".to_string(),
            });
        }
        if self.min_workers == 0 {
            return Err(Error::InvalidConfig {
                message: "min_workers must be at least 1".to_string(),
            });
        }
        if self.min_workers > self.max_workers {
            return Err(Error::InvalidConfig {
                message: format!(
                    "min_workers ({}) exceeds max_workers ({})",
                    self.min_workers, self.max_workers
                ),
            });
        }
        if self.max_buffered_results == Some(0) {
            return Err(Error::InvalidConfig {
                message: "max_buffered_results must be at least 1 when set".to_string(),
            });
        }
        if self.max_job_attempts == Some(0) {
            return Err(Error::InvalidConfig {
                message: "max_job_attempts must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}

/// Network configuration for the gRPC and HTTP surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the gRPC server binds to
    pub grpc_address: String,

    /// Address the HTTP API binds to, defaults to the gRPC port + 1000
    pub http_address: Option<String>,

    /// TCP keepalive interval
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,

    /// Maximum gRPC message size in bytes
    pub max_message_size: usize,

    /// Largest accepted job payload in bytes
    pub max_payload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            grpc_address: "0.0.0.0:50051".to_string(),
            http_address: None,
            tcp_keepalive: Duration::from_secs(60),
            max_message_size: 64 * 1024 * 1024, // 64MB
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
