//! Farm Core - Fault-tolerant job allocation
//!
//! Tracks a pool of remote workers, hands queued jobs to them, and keeps
//! the run going when workers die: a lost worker's jobs are put back in the
//! queue, losses are counted, and the `max_worker_loss` / `no_worker_kill`
//! policies decide when the run is beyond saving.

pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod queue;
pub mod types;
pub mod worker;

pub use allocator::{Allocator, Reclaim};
pub use config::{CoordinatorConfig, FarmConfig, JobFailurePolicy, ServerSettings};
pub use coordinator::{
    Coordinator, CoordinatorBuilder, CoordinatorHandle, CoordinatorStatus, RunReport, RunState,
    WorkerEvent,
};
pub use detector::{ConnectionEvent, ConnectionEventKind, FailureDetector, TransportFault, Verdict};
pub use error::{Error, Result};
pub use queue::{JobQueue, QueueStats};
pub use types::*;
pub use worker::{
    ChannelLink, LinkState, LossEvent, WorkerHealth, WorkerInfo, WorkerLink, WorkerRegistry,
    WorkerRegistryHandle,
};
