//! Coordinator binary entry point
//!
//! Usage: `coordinator [GRPC_ADDR] [CONFIG_JSON]`
//!
//! Runs in serve mode: the coordinator keeps accepting jobs after the queue
//! drains and only stops on Ctrl+C, SIGTERM or a fatal loss policy.
//! Unless the config sets `max_buffered_results`, only the newest 100k
//! outcomes are kept for `/api/results`.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordinator::middleware::InputValidator;
use coordinator::server::{shutdown_signal, BoxError};
use coordinator::{http_api, FarmServer, FarmService, ServerConfig};
use farm_core::{Coordinator, FarmConfig};

const SERVE_RESULT_BUFFER: usize = 100_000;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coordinator=info,farm_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let grpc_arg = args.next();
    let mut config = match args.next() {
        Some(path) => FarmConfig::from_json_file(&path)?,
        None => FarmConfig::default(),
    };
    if let Some(addr) = grpc_arg {
        config.server.grpc_address = addr;
    }
    config.coordinator.exit_when_drained = false;
    // Outcomes pile up until someone polls /api/results
    config
        .coordinator
        .max_buffered_results
        .get_or_insert(SERVE_RESULT_BUFFER);

    let server_config = ServerConfig::from_settings(&config.server)?;
    let http_addr = server_config.http_addr(&config.server)?;

    info!(
        grpc = %server_config.addr,
        http = %http_addr,
        max_worker_loss = config.coordinator.max_worker_loss,
        no_worker_kill = config.coordinator.no_worker_kill,
        "Starting coordinator"
    );

    let coordinator = Coordinator::new(config.coordinator.clone())?;
    let handle = coordinator.handle();

    let validator = InputValidator::new().with_max_payload_bytes(config.server.max_payload_bytes);
    let service = FarmService::with_validator(handle.clone(), validator);

    // Spawn HTTP server
    let http_router = http_api::create_router(Arc::new(service.clone()));
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_handle = tokio::spawn(async move {
        info!("HTTP API listening on {}", http_addr);
        if let Err(e) = axum::serve(listener, http_router).await {
            error!(error = %e, "HTTP server error");
        }
    });

    // Spawn gRPC server, stopped together with the coordinator
    let server = FarmServer::with_config(service, server_config);
    let grpc_handle = tokio::spawn(async move {
        if let Err(e) = server.run_until(std::future::pending()).await {
            error!(error = %e, "gRPC server error");
        }
    });

    let mut run = tokio::spawn(async move { coordinator.run().await });
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            handle.shutdown();
            (&mut run).await?
        }
        result = &mut run => result?,
    };

    let reached = handle.disconnect_workers("coordinator exiting");
    info!(workers = reached, "Workers disconnected");
    grpc_handle.abort();
    http_handle.abort();

    match outcome {
        Ok(report) => {
            info!(
                state = ?report.state,
                lost_worker_count = report.lost_worker_count,
                results = report.results.len(),
                "Coordinator finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                error = %e,
                unfinished = e.unfinished_jobs().map(|jobs| jobs.len()).unwrap_or_default(),
                "Coordinator aborted"
            );
            Err(e.into())
        }
    }
}
