//! Failure detection for worker connections
//!
//! The detector never infers a loss from timing. Whether a fault is
//! transient or permanent is decided by the transport that reports it
//! through [`TransportFault::is_terminal`]; a plain disconnect is always
//! treated as transient because the transport is expected to reconnect.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::worker::{LinkState, WorkerLink, WorkerRegistryHandle};
use crate::{JobId, WorkerId};

/// Fault reported by a transport for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransportFault {
    /// The transport will retry the connection
    Retryable(String),

    /// The worker announced it is crashing
    Crashed(String),

    /// The connection closed with an error it cannot recover from
    ClosedWithError(String),

    /// An external supervisor reported the worker process as dead
    SupervisorReported(String),
}

impl TransportFault {
    /// Returns true if the worker behind the connection is gone for good
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportFault::Retryable(_))
    }

    /// Human readable reason carried by the fault
    pub fn reason(&self) -> &str {
        match self {
            TransportFault::Retryable(r)
            | TransportFault::Crashed(r)
            | TransportFault::ClosedWithError(r)
            | TransportFault::SupervisorReported(r) => r,
        }
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            TransportFault::Retryable(_) => "retryable",
            TransportFault::Crashed(_) => "crashed",
            TransportFault::ClosedWithError(_) => "closed with error",
            TransportFault::SupervisorReported(_) => "reported dead by supervisor",
        };
        write!(f, "{}: {}", kind, self.reason())
    }
}

/// What happened to a connection
#[derive(Clone)]
pub enum ConnectionEventKind {
    /// Connection is up
    Connected,

    /// Connection dropped, transport is reconnecting
    Disconnected { reason: String },

    /// Transport re-established the connection with a fresh link
    Reconnected { link: Arc<dyn WorkerLink> },

    /// Transport reported a classified fault
    Faulted(TransportFault),
}

impl fmt::Debug for ConnectionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEventKind::Connected => write!(f, "Connected"),
            ConnectionEventKind::Disconnected { reason } => {
                f.debug_struct("Disconnected").field("reason", reason).finish()
            }
            ConnectionEventKind::Reconnected { .. } => write!(f, "Reconnected"),
            ConnectionEventKind::Faulted(fault) => f.debug_tuple("Faulted").field(fault).finish(),
        }
    }
}

/// Transport-level event for one worker
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub worker_id: WorkerId,
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    pub fn connected(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            kind: ConnectionEventKind::Connected,
        }
    }

    pub fn disconnected(worker_id: impl Into<WorkerId>, reason: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            kind: ConnectionEventKind::Disconnected {
                reason: reason.into(),
            },
        }
    }

    pub fn reconnected(worker_id: impl Into<WorkerId>, link: Arc<dyn WorkerLink>) -> Self {
        Self {
            worker_id: worker_id.into(),
            kind: ConnectionEventKind::Reconnected { link },
        }
    }

    pub fn faulted(worker_id: impl Into<WorkerId>, fault: TransportFault) -> Self {
        Self {
            worker_id: worker_id.into(),
            kind: ConnectionEventKind::Faulted(fault),
        }
    }
}

/// Classification of a connection event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Connection is up, nothing to do
    Healthy,

    /// Transient disconnect, the worker keeps its jobs
    Transient,

    /// Worker is back; `held` must be redelivered on the new link
    Recovered { held: BTreeSet<JobId> },

    /// Worker is permanently gone and held `jobs`
    Lost { jobs: BTreeSet<JobId> },

    /// Event for a worker that is not registered
    Unknown,
}

/// Classifies connection events and declares losses
#[derive(Debug)]
pub struct FailureDetector {
    registry: WorkerRegistryHandle,
    transient_faults: AtomicU64,
}

impl FailureDetector {
    /// Create a detector acting on `registry`
    pub fn new(registry: WorkerRegistryHandle) -> Self {
        Self {
            registry,
            transient_faults: AtomicU64::new(0),
        }
    }

    /// Transient disconnects absorbed so far
    pub fn transient_faults(&self) -> u64 {
        self.transient_faults.load(Ordering::Relaxed)
    }

    /// Classify an event, marking the worker lost on a terminal fault
    pub fn observe(&self, event: ConnectionEvent) -> Verdict {
        let worker_id = event.worker_id;
        if !self.registry.is_active(&worker_id) {
            debug!(worker_id = %worker_id, kind = ?event.kind, "Connection event for unknown worker");
            return Verdict::Unknown;
        }

        match event.kind {
            ConnectionEventKind::Connected => {
                self.set_link_state(&worker_id, LinkState::Connected);
                Verdict::Healthy
            }
            ConnectionEventKind::Disconnected { reason } => self.absorb(&worker_id, &reason),
            ConnectionEventKind::Faulted(fault) if !fault.is_terminal() => {
                self.absorb(&worker_id, fault.reason())
            }
            ConnectionEventKind::Faulted(fault) => {
                warn!(worker_id = %worker_id, fault = %fault, "Terminal transport fault");
                let jobs = self.registry.mark_lost(&worker_id);
                Verdict::Lost { jobs }
            }
            ConnectionEventKind::Reconnected { link } => {
                match self.registry.replace_link(&worker_id, link) {
                    Ok(held) => Verdict::Recovered { held },
                    Err(_) => Verdict::Unknown,
                }
            }
        }
    }

    fn absorb(&self, worker_id: &str, reason: &str) -> Verdict {
        self.transient_faults.fetch_add(1, Ordering::Relaxed);
        info!(worker_id = %worker_id, reason = %reason, "Worker disconnected, awaiting reconnect");
        self.set_link_state(worker_id, LinkState::Reconnecting);
        Verdict::Transient
    }

    fn set_link_state(&self, worker_id: &str, state: LinkState) {
        if let Err(e) = self.registry.set_link_state(worker_id, state) {
            debug!(worker_id = %worker_id, error = %e, "Link state update skipped");
        }
    }
}
