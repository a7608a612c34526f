// HTTP route handlers for the execution API

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use jexec_common::types::{
    ExecutionRequest, ExecutionResult, HealthResponse, JobStatusView, SubmitResponse,
    ValidationError,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

/// Body bytes were already authenticated; parse them as-is
fn parse_request(body: &Bytes) -> Result<ExecutionRequest, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(ValidationError::MalformedBody(e.to_string())))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::UnknownJobId(raw.to_string()))
}

/// GET /health - unauthenticated liveness and sandbox availability
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        docker_available: state.sandbox.runtime_available().await,
        sandbox: state.sandbox.kind().to_string(),
        timestamp: Utc::now(),
    })
}

/// POST /run - execute synchronously and return the result verbatim
pub async fn run_code(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ExecutionResult>, ApiError> {
    let request = parse_request(&body)?;
    let result = jexec_engine::execute(state.sandbox.as_ref(), &request, &state.limits).await?;
    Ok(Json(result))
}

/// POST /submit - queue a job and return its id without waiting for it
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request = parse_request(&body)?;

    // Reject what a worker would reject, before a job exists
    request.validate(&state.limits)?;
    jexec_engine::source::prepare(&request)?;

    // Claim a queue slot first so a full queue never leaves an orphaned job
    let permit = state.queue.try_reserve().map_err(|_| ApiError::QueueFull)?;

    let code_chars = request.code.chars().count();
    let job_id = state.store.create(request).await?;
    permit.send(job_id);

    info!(job_id = %job_id, code_chars, store = state.store.backend(), "Job queued");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /status/{job_id}
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.store.get(job_id).await?;
    debug!(job_id = %job_id, status = %job.status(), "Job status retrieved");
    Ok(Json(JobStatusView::from(&job)))
}

/// GET /result/{job_id} - only for completed jobs
pub async fn job_result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let result = state.store.result(job_id).await?;
    Ok(Json(result))
}
