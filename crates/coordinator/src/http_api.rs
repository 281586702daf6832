//! HTTP API for operators
//!
//! Provides REST endpoints to inspect the coordinator, submit jobs, collect
//! results and report dead workers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use farm_core::{CoordinatorStatus, Job, JobOutcome, JobResult, WorkerInfo};
use serde::{Deserialize, Serialize};
use tonic::Status;
use tower_http::cors::{Any, CorsLayer};

use crate::service::FarmService;

/// Shared state for HTTP handlers (Arc for thread-safe sharing)
pub type AppState = Arc<FarmService>;

/// Worker info for API response
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub hostname: String,
    pub link_state: String,
    pub assigned_jobs: Vec<u64>,
    pub jobs_finished: u64,
    pub registered_at: i64,
}

impl From<WorkerInfo> for WorkerResponse {
    fn from(info: WorkerInfo) -> Self {
        Self {
            id: info.id,
            hostname: info.hostname,
            link_state: format!("{:?}", info.link_state),
            assigned_jobs: info.assigned_jobs.into_iter().collect(),
            jobs_finished: info.jobs_finished,
            registered_at: info.registered_at.timestamp_millis(),
        }
    }
}

/// Unfinished job for API response
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: u64,
    pub status: String,
    pub assigned_worker: Option<String>,
    pub attempts: u32,
    pub payload_bytes: usize,
    pub submitted_at: i64,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: format!("{:?}", job.status),
            assigned_worker: job.assigned_worker,
            attempts: job.attempts,
            payload_bytes: job.payload.len(),
            submitted_at: job.submitted_at.timestamp_millis(),
        }
    }
}

/// Job outcome for API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultResponse {
    pub job_id: u64,
    pub worker_id: Option<String>,
    pub attempts: u32,
    pub success: bool,
    /// Output as UTF-8, lossy
    pub output: Option<String>,
    pub error: Option<String>,
    pub finished_at: i64,
}

impl From<JobOutcome> for ResultResponse {
    fn from(outcome: JobOutcome) -> Self {
        let (output, error) = match outcome.result {
            JobResult::Success(payload) => (Some(String::from_utf8_lossy(&payload).into_owned()), None),
            JobResult::Failure(reason) => (None, Some(reason)),
        };
        Self {
            job_id: outcome.job_id,
            worker_id: outcome.worker_id,
            attempts: outcome.attempts,
            success: error.is_none(),
            output,
            error,
            finished_at: outcome.finished_at.timestamp_millis(),
        }
    }
}

/// Job submission request, payloads are UTF-8 strings
#[derive(Debug, Deserialize)]
pub struct SubmitJobsRequest {
    pub payloads: Vec<String>,
}

/// Job submission response
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobsResponse {
    pub job_ids: Vec<u64>,
}

/// Loss report request
#[derive(Debug, Default, Deserialize)]
pub struct ReportLostRequest {
    #[serde(default)]
    pub reason: String,
}

/// Loss report response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportLostResponse {
    pub accepted: bool,
}

/// Create the HTTP API router
pub fn create_router(service: Arc<FarmService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/workers", get(get_workers))
        .route("/api/workers/:worker_id/lost", post(report_lost))
        .route("/api/jobs", get(get_jobs).post(submit_jobs))
        .route("/api/results", get(take_results))
        .layer(cors)
        .with_state(service)
}

/// Convert a validation or transport status into an HTTP error
fn status_response(status: Status) -> Response {
    let code = match status.code() {
        tonic::Code::InvalidArgument => StatusCode::BAD_REQUEST,
        tonic::Code::NotFound => StatusCode::NOT_FOUND,
        tonic::Code::AlreadyExists => StatusCode::CONFLICT,
        tonic::Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(serde_json::json!({"error": status.message()}))).into_response()
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// Get coordinator status
async fn get_status(State(service): State<AppState>) -> Json<CoordinatorStatus> {
    Json(service.coordinator().status())
}

/// Get all registered workers
async fn get_workers(State(service): State<AppState>) -> Json<Vec<WorkerResponse>> {
    let workers = service
        .coordinator()
        .workers()
        .into_iter()
        .map(WorkerResponse::from)
        .collect();
    Json(workers)
}

/// Get every job without an outcome
async fn get_jobs(State(service): State<AppState>) -> Json<Vec<JobResponse>> {
    let jobs = service
        .coordinator()
        .jobs()
        .into_iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

/// Submit new jobs
async fn submit_jobs(
    State(service): State<AppState>,
    Json(request): Json<SubmitJobsRequest>,
) -> Response {
    let payloads = request.payloads.into_iter().map(String::into_bytes).collect();
    match service.submit_payloads(payloads) {
        Ok(job_ids) => (StatusCode::CREATED, Json(SubmitJobsResponse { job_ids })).into_response(),
        Err(status) => status_response(status),
    }
}

/// Drain the buffered job outcomes
async fn take_results(State(service): State<AppState>) -> Json<Vec<ResultResponse>> {
    let results = service
        .coordinator()
        .take_results()
        .into_iter()
        .map(ResultResponse::from)
        .collect();
    Json(results)
}

/// Report a worker as dead on behalf of a supervisor
async fn report_lost(
    State(service): State<AppState>,
    Path(worker_id): Path<String>,
    request: Option<Json<ReportLostRequest>>,
) -> Response {
    let reason = request
        .map(|Json(r)| r.reason)
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "reported via HTTP API".to_string());

    match service.report_lost_worker(&worker_id, &reason) {
        Ok(accepted) => Json(ReportLostResponse { accepted }).into_response(),
        Err(status) => status_response(status),
    }
}
