//! Input validation for the coordinator surfaces
//!
//! Both the gRPC service and the HTTP API run worker-supplied identifiers
//! and job payloads through the same validator before they reach the core.

use tonic::Status;

/// Input validator for coordinator requests
#[derive(Debug, Clone)]
pub struct InputValidator {
    /// Maximum worker ID length
    max_worker_id_len: usize,
    /// Maximum hostname length
    max_hostname_len: usize,
    /// Maximum reason length for crash and loss reports
    max_reason_len: usize,
    /// Largest accepted job payload
    max_payload_bytes: usize,
    /// Maximum payloads in one submission
    max_batch_len: usize,
    /// Allowed characters pattern for IDs
    id_pattern: regex::Regex,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputValidator {
    /// Create a new input validator with default settings
    pub fn new() -> Self {
        Self {
            max_worker_id_len: 128,
            max_hostname_len: 255,
            max_reason_len: 1024,
            max_payload_bytes: 16 * 1024 * 1024,
            max_batch_len: 10_000,
            // Allow alphanumeric, hyphens, underscores, and dots
            id_pattern: regex::Regex::new(r"^[a-zA-Z0-9_\-\.]+$")
                .expect("worker id pattern is a valid regex"),
        }
    }

    /// Set the largest accepted payload
    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    /// Validate a worker ID
    pub fn validate_worker_id(&self, id: &str) -> Result<(), Status> {
        if id.is_empty() {
            return Err(Status::invalid_argument("Worker ID cannot be empty"));
        }

        if id.len() > self.max_worker_id_len {
            return Err(Status::invalid_argument(format!(
                "Worker ID exceeds maximum length of {} characters",
                self.max_worker_id_len
            )));
        }

        if !self.id_pattern.is_match(id) {
            return Err(Status::invalid_argument(
                "Worker ID contains invalid characters. Only alphanumeric, hyphens, underscores, and dots are allowed",
            ));
        }

        Ok(())
    }

    /// Validate the worker ID of a handshake, where empty asks for a generated one
    pub fn validate_requested_id(&self, id: &str) -> Result<(), Status> {
        if id.is_empty() {
            return Ok(());
        }
        self.validate_worker_id(id)
    }

    /// Validate a hostname
    pub fn validate_hostname(&self, hostname: &str) -> Result<(), Status> {
        if hostname.len() > self.max_hostname_len {
            return Err(Status::invalid_argument(format!(
                "Hostname exceeds maximum length of {} characters",
                self.max_hostname_len
            )));
        }
        if hostname.contains('\0') {
            return Err(Status::invalid_argument("Hostname contains null bytes"));
        }
        Ok(())
    }

    /// Validate a free-form reason string
    pub fn validate_reason(&self, reason: &str) -> Result<(), Status> {
        if reason.len() > self.max_reason_len {
            return Err(Status::invalid_argument(format!(
                "Reason exceeds maximum length of {} characters",
                self.max_reason_len
            )));
        }
        Ok(())
    }

    /// Validate a single job payload
    pub fn validate_payload(&self, payload: &[u8]) -> Result<(), Status> {
        if payload.len() > self.max_payload_bytes {
            return Err(Status::invalid_argument(format!(
                "Payload of {} bytes exceeds maximum of {} bytes",
                payload.len(),
                self.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Validate a batch of job payloads
    pub fn validate_batch<T: AsRef<[u8]>>(&self, payloads: &[T]) -> Result<(), Status> {
        if payloads.is_empty() {
            return Err(Status::invalid_argument("Submission contains no jobs"));
        }
        if payloads.len() > self.max_batch_len {
            return Err(Status::invalid_argument(format!(
                "Submission exceeds maximum of {} jobs",
                self.max_batch_len
            )));
        }
        payloads
            .iter()
            .try_for_each(|payload| self.validate_payload(payload.as_ref()))
    }
}
