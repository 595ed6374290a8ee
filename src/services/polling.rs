//! Polling stage: `Generate` → `ReadyToPublish` | `Failed` | `ReadyToGenerate`,
//! or no change when the generation is still running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::db::store::{JobStore, StoreError};
use crate::models::generation::GenerationStatus;
use crate::models::job::{ImageJob, JobStatus};
use crate::services::generation::{GenerationClient, GenerationError};

/// Per-tick polling budget for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    /// Wait between inconclusive attempts
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// What one polling pass did to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Published,
    Failed,
    /// Remote forgot the correlation id; job is back in `ReadyToGenerate`.
    Reset,
    /// Still running (or budget spent); revisited next tick.
    Pending,
    /// A store write failed mid-transition.
    StoreFailed,
    /// Another worker holds the job now; nothing was written.
    LeaseLost,
}

pub struct PollingStage {
    store: Arc<dyn JobStore>,
    client: Arc<dyn GenerationClient>,
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl PollingStage {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn GenerationClient>,
        policy: PollPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            policy,
            cancel,
        }
    }

    /// Claim and poll the oldest in-flight job.
    pub async fn run_next(&self) -> Result<bool, StoreError> {
        let Some(job) = self.store.claim_one_in_generate().await? else {
            return Ok(false);
        };
        self.process_claimed(job).await;
        Ok(true)
    }

    /// Claim every in-flight job and poll them one after another.
    pub async fn run_batch(&self) -> Result<usize, StoreError> {
        let jobs = self.store.claim_all_in_generate().await?;
        let count = jobs.len();
        if count > 0 {
            tracing::info!(count, "Polling claimed jobs");
        }
        for job in jobs {
            self.process_claimed(job).await;
        }
        Ok(count)
    }

    async fn process_claimed(&self, job: ImageJob) {
        if self.process_job(&job).await == PollResult::LeaseLost {
            return;
        }
        if let Err(e) = self.store.release_claim(job.id).await {
            tracing::warn!(job_id = job.id, error = %e, "Failed to release claim");
        }
    }

    /// Poll one claimed job up to the policy's attempt budget.
    pub async fn process_job(&self, job: &ImageJob) -> PollResult {
        let start = Instant::now();
        let result = self.poll_job(job).await;
        metrics::histogram!("image_job_stage_seconds", "stage" => "polling")
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn poll_job(&self, job: &ImageJob) -> PollResult {
        let Some(correlation_id) = job.correlation_id() else {
            tracing::warn!(job_id = job.id, "Job in Generate has no correlation id");
            return PollResult::Pending;
        };
        let attempts = self.policy.attempts;

        tracing::info!(job_id = job.id, correlation_id, "Starting status checks");

        for attempt in 1..=attempts {
            // Each attempt can take a full HTTP timeout plus the delay
            match self.store.renew_claim(job.id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(job_id = job.id, attempt, "Claim lost, abandoning status checks");
                    return PollResult::LeaseLost;
                }
                Err(e) => {
                    tracing::error!(job_id = job.id, error = %e, "Failed to renew claim");
                    return PollResult::StoreFailed;
                }
            }

            match self.client.poll(correlation_id).await {
                Ok(response) => {
                    tracing::info!(
                        job_id = job.id,
                        attempt,
                        attempts,
                        status = %response.status,
                        "Status check"
                    );
                    match response.status {
                        GenerationStatus::Done => match response.first_file() {
                            Some(file) => {
                                if response.censored {
                                    tracing::warn!(job_id = job.id, "Generated image was censored");
                                }
                                return self.publish(job, file).await;
                            }
                            None => {
                                tracing::warn!(job_id = job.id, "Generation done without files");
                            }
                        },
                        GenerationStatus::Failed => {
                            return self
                                .fail(job, response.error_description.as_deref())
                                .await;
                        }
                        _ => {}
                    }
                }
                Err(GenerationError::NotFound { .. }) => return self.reset(job).await,
                Err(e) => {
                    metrics::counter!("image_jobs_poll_errors_total").increment(1);
                    tracing::warn!(
                        job_id = job.id,
                        attempt,
                        attempts,
                        error = %e,
                        "Status check failed"
                    );
                    // Errored attempts are skipped without waiting
                    continue;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::debug!(job_id = job.id, "Polling interrupted by shutdown");
                        return PollResult::Pending;
                    }
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }
        }

        tracing::info!(job_id = job.id, "Generation still in progress, revisiting next tick");
        PollResult::Pending
    }

    async fn publish(&self, job: &ImageJob, file: &str) -> PollResult {
        if let Err(e) = self.store.set_result(job.id, file).await {
            return write_failed(job, "Failed to save result", e);
        }
        if let Err(e) = self.store.set_status(job.id, JobStatus::ReadyToPublish).await {
            return write_failed(job, "Failed to update job status", e);
        }

        metrics::counter!("image_jobs_completed_total").increment(1);
        tracing::info!(
            job_id = job.id,
            from = %JobStatus::Generate,
            to = %JobStatus::ReadyToPublish,
            "Job transitioned"
        );
        PollResult::Published
    }

    async fn fail(&self, job: &ImageJob, description: Option<&str>) -> PollResult {
        tracing::warn!(
            job_id = job.id,
            reason = description.unwrap_or("unspecified"),
            "Generation failed"
        );
        if let Err(e) = self.store.set_status(job.id, JobStatus::Failed).await {
            return write_failed(job, "Failed to update job status", e);
        }

        metrics::counter!("image_jobs_failed_total").increment(1);
        tracing::info!(
            job_id = job.id,
            from = %JobStatus::Generate,
            to = %JobStatus::Failed,
            "Job transitioned"
        );
        PollResult::Failed
    }

    async fn reset(&self, job: &ImageJob) -> PollResult {
        tracing::warn!(job_id = job.id, "Generation not found, resetting job");
        if let Err(e) = self.store.set_correlation_id(job.id, "").await {
            return write_failed(job, "Failed to clear correlation id", e);
        }
        if let Err(e) = self.store.set_status(job.id, JobStatus::ReadyToGenerate).await {
            return write_failed(job, "Failed to update job status", e);
        }

        metrics::counter!("image_jobs_reset_total").increment(1);
        tracing::info!(
            job_id = job.id,
            from = %JobStatus::Generate,
            to = %JobStatus::ReadyToGenerate,
            "Job transitioned"
        );
        PollResult::Reset
    }
}

fn write_failed(job: &ImageJob, message: &str, error: StoreError) -> PollResult {
    match error {
        StoreError::ClaimLost(_) => {
            tracing::warn!(job_id = job.id, "Claim lost while polling, discarding outcome");
            PollResult::LeaseLost
        }
        e => {
            tracing::error!(job_id = job.id, error = %e, "{}", message);
            PollResult::StoreFailed
        }
    }
}
