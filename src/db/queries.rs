use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;

use crate::db::store::StoreError;
use crate::models::job::{ImageJob, JobStatus};

const JOB_COLUMNS: &str =
    "id, prompt, correlation_id, status, result, created_at, updated_at";

/// Which rows a claim may pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimFilter {
    /// `ReadyToGenerate` with a non-empty prompt
    ReadyToGenerate,
    /// `Generate` with a non-empty correlation id
    InGenerate,
}

impl ClaimFilter {
    fn predicate(&self) -> &'static str {
        match self {
            ClaimFilter::ReadyToGenerate => {
                "status = 'ReadyToGenerate' AND prompt IS NOT NULL AND prompt <> ''"
            }
            ClaimFilter::InGenerate => {
                "status = 'Generate' AND correlation_id IS NOT NULL AND correlation_id <> ''"
            }
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<ImageJob, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status =
        JobStatus::from_str(&status_str).map_err(|_| StoreError::InvalidStatus(status_str))?;

    Ok(ImageJob {
        id: row.try_get("id")?,
        prompt: row.try_get("prompt")?,
        correlation_id: row.try_get("correlation_id")?,
        status,
        result: row.try_get("result")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new job in `ReadyToGenerate`
pub async fn create_job(pool: &PgPool, prompt: &str) -> Result<ImageJob, StoreError> {
    let sql = format!(
        "INSERT INTO image_jobs (prompt, status) VALUES ($1, 'ReadyToGenerate') RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql).bind(prompt).fetch_one(pool).await?;
    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<ImageJob>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM image_jobs WHERE id = $1");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Lease up to `limit` eligible jobs to `worker_id`.
///
/// Candidate rows are locked with `FOR UPDATE SKIP LOCKED`, so concurrent
/// callers never wait on each other, and rows still under another worker's
/// lease are excluded. The lease outlives the statement's transaction until
/// it is released or expires.
pub async fn claim_jobs(
    pool: &PgPool,
    filter: ClaimFilter,
    worker_id: &str,
    lease: Duration,
    limit: i64,
) -> Result<Vec<ImageJob>, StoreError> {
    let sql = format!(
        r#"
        UPDATE image_jobs
        SET claimed_by = $1,
            claim_expires_at = NOW() + make_interval(secs => $2),
            updated_at = NOW()
        WHERE id IN (
            SELECT id
            FROM image_jobs
            WHERE {predicate}
              AND (claim_expires_at IS NULL OR claim_expires_at < NOW())
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "#,
        predicate = filter.predicate(),
    );

    let rows = sqlx::query(&sql)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let mut jobs = rows
        .iter()
        .map(job_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    // RETURNING does not preserve the subquery order
    jobs.sort_by_key(|j| (j.created_at, j.id));
    Ok(jobs)
}

/// Drop `worker_id`'s lease on a job
pub async fn release_claim(pool: &PgPool, job_id: i64, worker_id: &str) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE image_jobs
        SET claimed_by = NULL,
            claim_expires_at = NULL,
            updated_at = NOW()
        WHERE id = $1 AND claimed_by = $2
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Push out `worker_id`'s lease on a job; `false` if another worker holds it
pub async fn renew_claim(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    lease: Duration,
) -> Result<bool, StoreError> {
    let renewed = sqlx::query(
        r#"
        UPDATE image_jobs
        SET claim_expires_at = NOW() + make_interval(secs => $3)
        WHERE id = $1 AND claimed_by = $2
        RETURNING id
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(lease.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    Ok(renewed.is_some())
}

// Field updates only apply to unclaimed rows or rows held by `worker_id`;
// they return whether a row was written.

/// Update job status
pub async fn update_status(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    status: JobStatus,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE image_jobs SET status = $1, updated_at = NOW()
        WHERE id = $2 AND (claimed_by IS NULL OR claimed_by = $3)
        "#,
    )
    .bind(status.as_str())
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Update the remote correlation id; an empty value clears it
pub async fn update_correlation_id(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    correlation_id: &str,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE image_jobs SET correlation_id = NULLIF($1, ''), updated_at = NOW()
        WHERE id = $2 AND (claimed_by IS NULL OR claimed_by = $3)
        "#,
    )
    .bind(correlation_id)
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Store the generated image payload
pub async fn update_result(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    result: &str,
) -> Result<bool, StoreError> {
    let written = sqlx::query(
        r#"
        UPDATE image_jobs SET result = $1, updated_at = NOW()
        WHERE id = $2 AND (claimed_by IS NULL OR claimed_by = $3)
        "#,
    )
    .bind(result)
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(written.rows_affected() > 0)
}

/// Job counts grouped by status (for health reporting)
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(JobStatus, i64)>, StoreError> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM image_jobs GROUP BY status ORDER BY status")
        .fetch_all(pool)
        .await?;

    let mut counts = Vec::with_capacity(rows.len());
    for row in rows {
        let status_str: String = row.try_get("status")?;
        match JobStatus::from_str(&status_str) {
            Ok(status) => counts.push((status, row.try_get("n")?)),
            Err(_) => tracing::warn!(status = %status_str, "Ignoring unknown job status"),
        }
    }
    Ok(counts)
}
