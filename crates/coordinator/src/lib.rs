//! Coordinator gRPC server for the job farm
//!
//! This crate puts the fault-tolerant core from `farm-core` on the network:
//! - **Worker sessions**: one bidirectional `Attach` stream per worker
//! - **Failure classification**: stream faults mapped to transport faults
//! - **Operator API**: job submission, status and results over gRPC and HTTP
//! - **Security**: input validation for ids and payloads
//!
//! # Example
//!
//! ```ignore
//! use coordinator::{FarmServer, FarmService};
//! use farm_core::{Coordinator, CoordinatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let coordinator = Coordinator::new(CoordinatorConfig::default())?;
//!     let service = FarmService::new(coordinator.handle());
//!     tokio::spawn(FarmServer::new(service).run());
//!     let report = coordinator.run().await?;
//!     println!("{:?}", report.state);
//!     Ok(())
//! }
//! ```

pub mod http_api;
pub mod middleware;
pub mod server;
pub mod service;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("farm");
}

// Re-export main types
pub use server::{FarmServer, ServerConfig};
pub use service::{FarmService, GrpcLink};

// Re-export proto service for convenience
pub use proto::farm_client::FarmClient;
pub use proto::farm_server::FarmServer as FarmServiceServer;
