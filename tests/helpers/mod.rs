//! In-memory fakes for the job store and the generation API.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use image_gen_queue::db::store::{JobStore, StoreError};
use image_gen_queue::models::generation::{GenerationRequest, GenerationStatus, PollResponse};
use image_gen_queue::models::job::{ImageJob, JobStatus};
use image_gen_queue::services::generation::{GenerationClient, GenerationError, SubmitOutcome};

struct Row {
    job: ImageJob,
    claimed: bool,
    /// Renewals still granted before the claim counts as taken over.
    renewals_left: Option<usize>,
}

impl Row {
    fn lost(&self) -> bool {
        self.renewals_left == Some(0)
    }
}

/// Job store with the same claim visibility rules as the PostgreSQL one.
#[derive(Default)]
pub struct MemoryJobStore {
    rows: Mutex<BTreeMap<i64, Row>>,
    fail_writes: AtomicBool,
    releases: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job; later ids get later `created_at`.
    pub fn insert(&self, id: i64, prompt: Option<&str>, status: JobStatus, correlation_id: Option<&str>) {
        let created = Utc::now() - ChronoDuration::hours(1) + ChronoDuration::seconds(id);
        let job = ImageJob {
            id,
            prompt: prompt.map(str::to_string),
            correlation_id: correlation_id.map(str::to_string),
            status,
            result: None,
            created_at: created,
            updated_at: created,
        };
        self.rows
            .lock()
            .unwrap()
            .insert(
                id,
                Row {
                    job,
                    claimed: false,
                    renewals_left: None,
                },
            );
    }

    pub fn get(&self, id: i64) -> ImageJob {
        self.rows.lock().unwrap()[&id].job.clone()
    }

    pub fn is_claimed(&self, id: i64) -> bool {
        self.rows.lock().unwrap()[&id].claimed
    }

    pub fn claim_externally(&self, id: i64) {
        self.rows.lock().unwrap().get_mut(&id).unwrap().claimed = true;
    }

    /// After `renewals` more successful renewals, the job behaves as if
    /// another worker had taken it over: renewals fail and writes are
    /// refused with `ClaimLost`.
    pub fn lose_claim_after(&self, id: i64, renewals: usize) {
        self.rows.lock().unwrap().get_mut(&id).unwrap().renewals_left = Some(renewals);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn claim<F>(&self, eligible: F, limit: usize) -> Vec<ImageJob>
    where
        F: Fn(&ImageJob) -> bool,
    {
        let mut rows = self.rows.lock().unwrap();
        let mut candidates: Vec<&mut Row> = rows
            .values_mut()
            .filter(|row| !row.claimed && eligible(&row.job))
            .collect();
        candidates.sort_by_key(|row| (row.job.created_at, row.job.id));

        candidates
            .into_iter()
            .take(limit)
            .map(|row| {
                row.claimed = true;
                row.job.clone()
            })
            .collect()
    }

    fn update<F>(&self, id: i64, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ImageJob),
    {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            if row.lost() {
                return Err(StoreError::ClaimLost(id));
            }
            apply(&mut row.job);
            row.job.updated_at = Utc::now();
        }
        Ok(())
    }
}

fn ready_to_generate(job: &ImageJob) -> bool {
    job.status == JobStatus::ReadyToGenerate && !job.prompt_text().is_empty()
}

fn in_generate(job: &ImageJob) -> bool {
    job.status == JobStatus::Generate && job.correlation_id().is_some()
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn claim_one_ready_to_generate(&self) -> Result<Option<ImageJob>, StoreError> {
        Ok(self.claim(ready_to_generate, 1).into_iter().next())
    }

    async fn claim_all_ready_to_generate(&self) -> Result<Vec<ImageJob>, StoreError> {
        Ok(self.claim(ready_to_generate, usize::MAX))
    }

    async fn claim_one_in_generate(&self) -> Result<Option<ImageJob>, StoreError> {
        Ok(self.claim(in_generate, 1).into_iter().next())
    }

    async fn claim_all_in_generate(&self) -> Result<Vec<ImageJob>, StoreError> {
        Ok(self.claim(in_generate, usize::MAX))
    }

    async fn set_status(&self, id: i64, status: JobStatus) -> Result<(), StoreError> {
        self.update(id, |job| job.status = status)
    }

    async fn set_correlation_id(&self, id: i64, value: &str) -> Result<(), StoreError> {
        let value = (!value.is_empty()).then(|| value.to_string());
        self.update(id, |job| job.correlation_id = value)
    }

    async fn set_result(&self, id: i64, value: &str) -> Result<(), StoreError> {
        self.update(id, |job| job.result = Some(value.to_string()))
    }

    async fn renew_claim(&self, id: i64) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        match row.renewals_left {
            None => Ok(true),
            Some(0) => Ok(false),
            Some(n) => {
                row.renewals_left = Some(n - 1);
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, id: i64) -> Result<(), StoreError> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.claimed = false;
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Generation API that replays queued answers.
///
/// Submissions with nothing queued are accepted as `uuid-<n>`; polls with
/// nothing queued report `PROCESSING`.
#[derive(Default)]
pub struct ScriptedClient {
    submits: Mutex<VecDeque<SubmitOutcome>>,
    polls: Mutex<VecDeque<Result<PollResponse, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    polled: Mutex<Vec<String>>,
    submit_delay: Mutex<Duration>,
    submits_in_flight: AtomicUsize,
    polls_during_submit: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, correlation_id: &str) {
        self.submits.lock().unwrap().push_back(SubmitOutcome::Accepted {
            correlation_id: correlation_id.to_string(),
            status: "INITIAL".to_string(),
        });
    }

    pub fn reject(&self, status: u16, body: &str) {
        self.submits.lock().unwrap().push_back(SubmitOutcome::Rejected {
            cause: GenerationError::Api {
                status,
                body: body.to_string(),
            },
        });
    }

    pub fn respond(&self, status: &str, files: &[&str]) {
        self.polls.lock().unwrap().push_back(Ok(poll_response(status, files)));
    }

    pub fn respond_not_found(&self, correlation_id: &str) {
        self.polls
            .lock()
            .unwrap()
            .push_back(Err(GenerationError::NotFound {
                correlation_id: correlation_id.to_string(),
            }));
    }

    pub fn respond_error(&self, status: u16) {
        self.polls.lock().unwrap().push_back(Err(GenerationError::Api {
            status,
            body: "upstream unavailable".to_string(),
        }));
    }

    /// Make every submission take `delay` before answering.
    pub fn slow_submits(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polled.lock().unwrap().len()
    }

    /// Polls that arrived while a submission was still waiting on its answer.
    pub fn polls_during_submit(&self) -> usize {
        self.polls_during_submit.load(Ordering::SeqCst)
    }
}

pub fn poll_response(status: &str, files: &[&str]) -> PollResponse {
    PollResponse {
        correlation_id: "abc".to_string(),
        status: GenerationStatus::parse(status),
        files: files.iter().map(|f| f.to_string()).collect(),
        censored: false,
        error_description: (status == "FAIL" || status == "FAILED")
            .then(|| "model error".to_string()),
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn submit(&self, request: &GenerationRequest) -> SubmitOutcome {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let delay = *self.submit_delay.lock().unwrap();
        self.submits_in_flight.fetch_add(1, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.submits_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SubmitOutcome::Accepted {
                correlation_id: format!("uuid-{n}"),
                status: "INITIAL".to_string(),
            })
    }

    async fn poll(&self, correlation_id: &str) -> Result<PollResponse, GenerationError> {
        if self.submits_in_flight.load(Ordering::SeqCst) > 0 {
            self.polls_during_submit.fetch_add(1, Ordering::SeqCst);
        }
        self.polled.lock().unwrap().push(correlation_id.to_string());
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(poll_response("PROCESSING", &[])))
    }
}
