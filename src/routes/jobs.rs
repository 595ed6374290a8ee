use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::api::{CreateJobRequest, CreateJobResponse, JobStatusResponse};

/// POST /api/v1/jobs: queue a prompt for generation.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), StatusCode> {
    if request.prompt.trim().is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    request
        .validate()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let job = queries::create_job(&state.db, &request.prompt)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    metrics::counter!("image_jobs_created_total").increment(1);
    tracing::info!(job_id = job.id, "Job created");

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /api/v1/jobs/{id}: current state of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = queries::get_job(&state.db, job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(job.into()))
}
