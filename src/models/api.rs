use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{ImageJob, JobStatus};

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[garde(length(min = 1, max = 20000))]
    pub prompt: String,
}

/// Response after queueing a job.
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: i64,
    pub status: JobStatus,
}

/// Response for `GET /api/v1/jobs/{id}`.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: i64,
    pub status: JobStatus,
    /// No further stage will touch the job
    pub finished: bool,
    pub correlation_id: Option<String>,
    pub has_result: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<ImageJob> for JobStatusResponse {
    fn from(job: ImageJob) -> Self {
        Self {
            job_id: job.id,
            finished: job.status.is_terminal(),
            status: job.status,
            correlation_id: job.correlation_id().map(str::to_string),
            has_result: job.result.is_some(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
