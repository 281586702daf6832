//! Network front of the farm: the tonic server hosting `FarmService`
//!
//! Workers attach here and operators submit jobs. The server stops on a
//! caller supplied future, so the binary can tie it to the coordinator run.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use farm_core::ServerSettings;
use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::proto::farm_server::FarmServer as FarmGrpcServer;
use crate::service::FarmService;

/// Boxed error returned by the servers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coordinator server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub addr: SocketAddr,

    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,

    /// Maximum encoded or decoded message size
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            tcp_keepalive: Some(Duration::from_secs(60)),
            max_message_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl ServerConfig {
    /// Build a server configuration from the farm settings
    pub fn from_settings(settings: &ServerSettings) -> Result<Self, BoxError> {
        let addr: SocketAddr = settings.grpc_address.parse().map_err(|e| {
            format!("invalid grpc_address {:?}: {}", settings.grpc_address, e)
        })?;
        Ok(Self {
            addr,
            tcp_keepalive: Some(settings.tcp_keepalive),
            max_message_size: settings.max_message_size,
        })
    }

    /// HTTP API address: explicit, or the gRPC port + 1000 on the same host
    pub fn http_addr(&self, settings: &ServerSettings) -> Result<SocketAddr, BoxError> {
        match &settings.http_address {
            Some(addr) => Ok(addr
                .parse::<SocketAddr>()
                .map_err(|e| format!("invalid http_address {addr:?}: {e}"))?),
            None => {
                let port = self
                    .addr
                    .port()
                    .checked_add(1000)
                    .ok_or("gRPC port too high to derive the HTTP port")?;
                Ok(SocketAddr::new(self.addr.ip(), port))
            }
        }
    }
}

/// Coordinator gRPC server
pub struct FarmServer {
    config: ServerConfig,
    service: FarmService,
}

impl FarmServer {
    /// Create a new coordinator server
    pub fn new(service: FarmService) -> Self {
        Self {
            config: ServerConfig::default(),
            service,
        }
    }

    /// Create with custom configuration
    pub fn with_config(service: FarmService, config: ServerConfig) -> Self {
        Self { config, service }
    }

    /// Run the server until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<(), BoxError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.config.addr;

        info!(address = %addr, "Starting farm gRPC server");

        let grpc_service = FarmGrpcServer::new(self.service)
            .max_decoding_message_size(self.config.max_message_size)
            .max_encoding_message_size(self.config.max_message_size);

        let mut server_builder = Server::builder();

        if let Some(keepalive) = self.config.tcp_keepalive {
            server_builder = server_builder.tcp_keepalive(Some(keepalive));
        }

        let server = server_builder
            .add_service(grpc_service)
            .serve_with_shutdown(addr, shutdown);

        info!(address = %addr, "Farm gRPC server listening");

        server.await.map_err(|e| {
            error!(error = %e, "Server error");
            Box::new(e) as BoxError
        })?;

        info!("Farm gRPC server shutdown complete");
        Ok(())
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
