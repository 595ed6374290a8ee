//! Submission stage: `ReadyToGenerate` → `Generate` | `Failed`.

use std::sync::Arc;
use std::time::Instant;

use crate::config::GenerationDefaults;
use crate::db::store::{JobStore, StoreError};
use crate::models::job::{ImageJob, JobStatus};
use crate::services::generation::{GenerationClient, SubmitOutcome};
use crate::services::prompt::{normalize_prompt, MAX_PROMPT_CHARS};

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    Submitted { correlation_id: String },
    Failed,
    /// A store write failed; the job is retried on a later tick.
    StoreFailed,
    /// Another worker holds the job now; nothing was written.
    LeaseLost,
}

pub struct SubmissionStage {
    store: Arc<dyn JobStore>,
    client: Arc<dyn GenerationClient>,
    defaults: GenerationDefaults,
}

impl SubmissionStage {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn GenerationClient>,
        defaults: GenerationDefaults,
    ) -> Self {
        Self {
            store,
            client,
            defaults,
        }
    }

    /// Claim and submit the oldest pending job. Returns `Ok(false)` when
    /// nothing was pending.
    pub async fn run_next(&self) -> Result<bool, StoreError> {
        let Some(job) = self.store.claim_one_ready_to_generate().await? else {
            return Ok(false);
        };
        self.process_claimed(job).await;
        Ok(true)
    }

    /// Claim every pending job and submit them one after another.
    pub async fn run_batch(&self) -> Result<usize, StoreError> {
        let jobs = self.store.claim_all_ready_to_generate().await?;
        let count = jobs.len();
        if count > 0 {
            tracing::info!(count, "Submitting claimed jobs");
        }
        for job in jobs {
            self.process_claimed(job).await;
        }
        Ok(count)
    }

    async fn process_claimed(&self, job: ImageJob) {
        if self.process_job(&job).await == SubmissionResult::LeaseLost {
            return;
        }
        if let Err(e) = self.store.release_claim(job.id).await {
            tracing::warn!(job_id = job.id, error = %e, "Failed to release claim");
        }
    }

    /// Submit one claimed job and record the outcome.
    pub async fn process_job(&self, job: &ImageJob) -> SubmissionResult {
        let start = Instant::now();
        let result = self.submit(job).await;
        metrics::histogram!("image_job_stage_seconds", "stage" => "submission")
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn submit(&self, job: &ImageJob) -> SubmissionResult {
        // Jobs later in a batch may have outlived the lease taken at claim time
        match self.store.renew_claim(job.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = job.id, "Claim lost before submission, skipping job");
                return SubmissionResult::LeaseLost;
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to renew claim");
                return SubmissionResult::StoreFailed;
            }
        }

        let original = job.prompt_text();
        let prompt = normalize_prompt(original, MAX_PROMPT_CHARS);
        if prompt.len() != original.len() {
            tracing::info!(
                job_id = job.id,
                from_chars = original.chars().count(),
                to_chars = MAX_PROMPT_CHARS,
                "Prompt truncated"
            );
        }

        tracing::info!(job_id = job.id, prompt = %prompt, "Submitting job");
        let request = self.defaults.request_for(prompt);

        match self.client.submit(&request).await {
            SubmitOutcome::Accepted {
                correlation_id,
                status,
            } => {
                tracing::info!(
                    job_id = job.id,
                    correlation_id = %correlation_id,
                    remote_status = %status,
                    "Generation accepted"
                );

                if let Err(e) = self.store.set_correlation_id(job.id, &correlation_id).await {
                    return write_failed(job, "Failed to store correlation id", e);
                }
                if let Err(e) = self.store.set_status(job.id, JobStatus::Generate).await {
                    return write_failed(job, "Failed to update job status", e);
                }

                metrics::counter!("image_jobs_submitted_total").increment(1);
                tracing::info!(
                    job_id = job.id,
                    from = %JobStatus::ReadyToGenerate,
                    to = %JobStatus::Generate,
                    correlation_id = %correlation_id,
                    "Job transitioned"
                );
                SubmissionResult::Submitted { correlation_id }
            }
            SubmitOutcome::Rejected { cause } => {
                tracing::error!(job_id = job.id, error = %cause, "Generation request rejected");
                metrics::counter!("image_jobs_submit_failed_total").increment(1);

                if let Err(e) = self.store.set_status(job.id, JobStatus::Failed).await {
                    return write_failed(job, "Failed to update job status", e);
                }

                tracing::info!(
                    job_id = job.id,
                    from = %JobStatus::ReadyToGenerate,
                    to = %JobStatus::Failed,
                    "Job transitioned"
                );
                SubmissionResult::Failed
            }
        }
    }
}

fn write_failed(job: &ImageJob, message: &str, error: StoreError) -> SubmissionResult {
    match error {
        StoreError::ClaimLost(_) => {
            tracing::warn!(job_id = job.id, "Claim lost during submission, discarding outcome");
            SubmissionResult::LeaseLost
        }
        e => {
            tracing::error!(job_id = job.id, error = %e, "{}", message);
            SubmissionResult::StoreFailed
        }
    }
}
