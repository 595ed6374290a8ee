mod helpers;

use helpers::{MemoryJobStore, ScriptedClient};
use image_gen_queue::models::job::JobStatus;
use image_gen_queue::services::polling::{PollPolicy, PollResult, PollingStage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn fast_policy() -> PollPolicy {
    PollPolicy {
        attempts: 3,
        delay: Duration::from_millis(5),
    }
}

fn stage(store: &Arc<MemoryJobStore>, client: &Arc<ScriptedClient>) -> PollingStage {
    PollingStage::new(
        store.clone(),
        client.clone(),
        fast_policy(),
        CancellationToken::new(),
    )
}

#[test]
fn test_default_policy() {
    let policy = PollPolicy::default();
    assert_eq!(policy.attempts, 3);
    assert_eq!(policy.delay, Duration::from_secs(2));
}

#[tokio::test]
async fn test_done_job_is_published() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));
    client.respond("DONE", &["base64data"]);

    assert!(stage(&store, &client).run_next().await.unwrap());

    let job = store.get(1);
    assert_eq!(job.status, JobStatus::ReadyToPublish);
    assert_eq!(job.result.as_deref(), Some("base64data"));
    assert_eq!(client.poll_count(), 1);
    assert!(!store.is_claimed(1));
}

#[tokio::test]
async fn test_done_after_processing_within_budget() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));
    client.respond("INITIAL", &[]);
    client.respond("PROCESSING", &[]);
    client.respond("DONE", &["first", "second"]);

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::Published);
    assert_eq!(store.get(1).result.as_deref(), Some("first"));
    assert_eq!(client.poll_count(), 3);
}

#[tokio::test]
async fn test_failed_generation_marks_job_failed() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));
    client.respond("FAILED", &[]);

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::Failed);

    let job = store.get(1);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    assert_eq!(client.poll_count(), 1);
}

#[tokio::test]
async fn test_not_found_resets_job() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));
    client.respond_not_found("abc");

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::Reset);

    let job = store.get(1);
    assert_eq!(job.status, JobStatus::ReadyToGenerate);
    assert_eq!(job.correlation_id(), None);
    assert_eq!(client.poll_count(), 1);
}

#[tokio::test]
async fn test_still_processing_leaves_job_unchanged() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::Pending);

    let job = store.get(1);
    assert_eq!(job.status, JobStatus::Generate);
    assert_eq!(job.correlation_id(), Some("abc"));
    assert_eq!(client.poll_count(), 3);
}

#[tokio::test]
async fn test_transport_errors_consume_attempts() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));
    client.respond_error(502);
    client.respond_error(503);
    client.respond("DONE", &["img"]);

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::Published);
    assert_eq!(client.poll_count(), 3);
}

#[tokio::test]
async fn test_errors_exhausting_budget_are_not_terminal() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));
    for _ in 0..3 {
        client.respond_error(500);
    }

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::Pending);
    assert_eq!(store.get(1).status, JobStatus::Generate);
}

#[tokio::test]
async fn test_done_without_files_is_inconclusive() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("sunset"), JobStatus::Generate, Some("abc"));
    client.respond("DONE", &[]);
    client.respond("DONE", &["late"]);

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::Published);
    assert_eq!(store.get(1).result.as_deref(), Some("late"));
}

#[tokio::test]
async fn test_batch_outcomes_stay_in_allowed_states() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    for id in 1..=4 {
        store.insert(id, Some("p"), JobStatus::Generate, Some(&format!("c{id}")));
    }
    // job 1
    client.respond("DONE", &["img1"]);
    // job 2
    client.respond("FAILED", &[]);
    // job 3
    client.respond_not_found("c3");
    // job 4 falls through to PROCESSING x3

    assert_eq!(stage(&store, &client).run_batch().await.unwrap(), 4);

    let one = store.get(1);
    assert_eq!(one.status, JobStatus::ReadyToPublish);
    assert_eq!(one.result.as_deref(), Some("img1"));
    assert_eq!(store.get(2).status, JobStatus::Failed);
    let three = store.get(3);
    assert_eq!(three.status, JobStatus::ReadyToGenerate);
    assert_eq!(three.correlation_id(), None);
    let four = store.get(4);
    assert_eq!(four.status, JobStatus::Generate);
    assert_eq!(four.correlation_id(), Some("c4"));
    assert_eq!(store.releases(), 4);
}

#[tokio::test]
async fn test_jobs_without_correlation_id_not_claimed() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("p"), JobStatus::Generate, None);
    store.insert(2, Some("p"), JobStatus::Generate, Some(""));

    assert!(!stage(&store, &client).run_next().await.unwrap());
    assert_eq!(client.poll_count(), 0);
}

#[tokio::test]
async fn test_cancellation_cuts_delay_short() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("p"), JobStatus::Generate, Some("abc"));

    let cancel = CancellationToken::new();
    let polling = PollingStage::new(
        store.clone(),
        client.clone(),
        PollPolicy {
            attempts: 3,
            delay: Duration::from_secs(30),
        },
        cancel.clone(),
    );
    cancel.cancel();

    let started = Instant::now();
    let job = store.get(1);
    assert_eq!(polling.process_job(&job).await, PollResult::Pending);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.poll_count(), 1);
    assert_eq!(store.get(1).status, JobStatus::Generate);
}

#[tokio::test]
async fn test_store_failure_on_publish() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("p"), JobStatus::Generate, Some("abc"));
    client.respond("DONE", &["img"]);
    store.fail_writes(true);

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::StoreFailed);
    assert_eq!(store.get(1).status, JobStatus::Generate);
}

#[tokio::test]
async fn test_errored_attempts_skip_the_delay() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("p"), JobStatus::Generate, Some("abc"));
    client.respond_error(502);
    client.respond_error(502);
    client.respond("DONE", &["img"]);

    let polling = PollingStage::new(
        store.clone(),
        client.clone(),
        PollPolicy {
            attempts: 3,
            delay: Duration::from_secs(1),
        },
        CancellationToken::new(),
    );

    let started = Instant::now();
    let job = store.get(1);
    assert_eq!(polling.process_job(&job).await, PollResult::Published);
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "waited {:?} after errored attempts",
        started.elapsed()
    );
    assert_eq!(client.poll_count(), 3);
}

#[tokio::test]
async fn test_claim_lost_between_attempts_stops_polling() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("p"), JobStatus::Generate, Some("abc"));
    store.lose_claim_after(1, 1);

    let job = store.get(1);
    assert_eq!(stage(&store, &client).process_job(&job).await, PollResult::LeaseLost);
    assert_eq!(client.poll_count(), 1);
    assert_eq!(store.get(1).status, JobStatus::Generate);
}

#[tokio::test]
async fn test_claim_lost_before_publish_discards_result() {
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(ScriptedClient::new());
    store.insert(1, Some("p"), JobStatus::Generate, Some("abc"));
    store.lose_claim_after(1, 1);
    client.respond("DONE", &["img"]);

    assert!(stage(&store, &client).run_next().await.unwrap());

    let job = store.get(1);
    assert_eq!(job.status, JobStatus::Generate);
    assert!(job.result.is_none());
    assert_eq!(store.releases(), 0);
}
