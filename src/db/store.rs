//! Job store contract consumed by the submission and polling stages.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use crate::db::queries::{self, ClaimFilter};
use crate::models::job::{ImageJob, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown job status in database: {0}")]
    InvalidStatus(String),

    /// Another worker took the job over after this worker's lease ran out.
    #[error("Job {0} is no longer held by this worker")]
    ClaimLost(i64),
}

/// Claim and field-update operations over the job table.
///
/// A claimed job is invisible to every other caller until the claim is
/// released or its lease runs out. Field updates touch one column plus
/// `updated_at` and are idempotent; they fail with [`StoreError::ClaimLost`]
/// when the row is held by a different worker.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Oldest `ReadyToGenerate` job with a non-empty prompt.
    async fn claim_one_ready_to_generate(&self) -> Result<Option<ImageJob>, StoreError>;

    async fn claim_all_ready_to_generate(&self) -> Result<Vec<ImageJob>, StoreError>;

    /// Oldest `Generate` job with a non-empty correlation id.
    async fn claim_one_in_generate(&self) -> Result<Option<ImageJob>, StoreError>;

    async fn claim_all_in_generate(&self) -> Result<Vec<ImageJob>, StoreError>;

    async fn set_status(&self, id: i64, status: JobStatus) -> Result<(), StoreError>;

    /// An empty value clears the correlation id.
    async fn set_correlation_id(&self, id: i64, value: &str) -> Result<(), StoreError>;

    async fn set_result(&self, id: i64, value: &str) -> Result<(), StoreError>;

    /// Extend this worker's lease on `id` by a full lease period.
    ///
    /// Returns `false` when the job is no longer held by this worker, in
    /// which case the caller must leave it alone.
    async fn renew_claim(&self, id: i64) -> Result<bool, StoreError>;

    async fn release_claim(&self, id: i64) -> Result<(), StoreError>;
}

/// PostgreSQL-backed [`JobStore`] holding leases under one worker id.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    worker_id: String,
    lease: Duration,
    batch_size: i64,
}

impl PgJobStore {
    pub fn new(pool: PgPool, worker_id: impl Into<String>, lease: Duration, batch_size: i64) -> Self {
        Self {
            pool,
            worker_id: worker_id.into(),
            lease,
            batch_size: batch_size.max(1),
        }
    }

    async fn claim(&self, filter: ClaimFilter, limit: i64) -> Result<Vec<ImageJob>, StoreError> {
        queries::claim_jobs(&self.pool, filter, &self.worker_id, self.lease, limit).await
    }

    fn owned(id: i64, updated: bool) -> Result<(), StoreError> {
        if updated {
            Ok(())
        } else {
            Err(StoreError::ClaimLost(id))
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn claim_one_ready_to_generate(&self) -> Result<Option<ImageJob>, StoreError> {
        Ok(self.claim(ClaimFilter::ReadyToGenerate, 1).await?.into_iter().next())
    }

    async fn claim_all_ready_to_generate(&self) -> Result<Vec<ImageJob>, StoreError> {
        self.claim(ClaimFilter::ReadyToGenerate, self.batch_size).await
    }

    async fn claim_one_in_generate(&self) -> Result<Option<ImageJob>, StoreError> {
        Ok(self.claim(ClaimFilter::InGenerate, 1).await?.into_iter().next())
    }

    async fn claim_all_in_generate(&self) -> Result<Vec<ImageJob>, StoreError> {
        self.claim(ClaimFilter::InGenerate, self.batch_size).await
    }

    async fn set_status(&self, id: i64, status: JobStatus) -> Result<(), StoreError> {
        let updated = queries::update_status(&self.pool, id, &self.worker_id, status).await?;
        Self::owned(id, updated)
    }

    async fn set_correlation_id(&self, id: i64, value: &str) -> Result<(), StoreError> {
        let updated =
            queries::update_correlation_id(&self.pool, id, &self.worker_id, value).await?;
        Self::owned(id, updated)
    }

    async fn set_result(&self, id: i64, value: &str) -> Result<(), StoreError> {
        let updated = queries::update_result(&self.pool, id, &self.worker_id, value).await?;
        Self::owned(id, updated)
    }

    async fn renew_claim(&self, id: i64) -> Result<bool, StoreError> {
        queries::renew_claim(&self.pool, id, &self.worker_id, self.lease).await
    }

    async fn release_claim(&self, id: i64) -> Result<(), StoreError> {
        queries::release_claim(&self.pool, id, &self.worker_id).await
    }
}
