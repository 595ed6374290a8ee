//! Drives the submission and polling stages.
//!
//! Continuous mode runs each stage on its own fixed tick. Calendar mode
//! fires batch passes from cron expressions, optionally serialized through
//! a [`StageGate`] so the two stages never run at the same time within one
//! process. Both modes stop scheduling on cancellation and let in-flight
//! work finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;

use crate::services::polling::PollingStage;
use crate::services::submission::SubmissionStage;

pub const SUBMISSION_TICK: Duration = Duration::from_secs(1);
pub const POLLING_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Cron scheduler error: {0}")]
    Cron(#[from] JobSchedulerError),
}

/// Which stages a continuous run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSelection {
    pub generator: bool,
    pub processor: bool,
}

/// Cron expressions (seconds resolution) for calendar mode.
#[derive(Debug, Clone)]
pub struct CalendarSchedule {
    pub generator: String,
    pub processor: String,
    pub serialize_stages: bool,
}

/// Optional mutual exclusion between stage runs.
///
/// When serialized, a run that starts while another is in progress waits
/// for it to finish; runs are never skipped.
#[derive(Clone, Default)]
pub struct StageGate {
    lock: Option<Arc<Mutex<()>>>,
}

impl StageGate {
    pub fn new(serialize: bool) -> Self {
        Self {
            lock: serialize.then(|| Arc::new(Mutex::new(()))),
        }
    }

    pub fn is_serialized(&self) -> bool {
        self.lock.is_some()
    }

    pub async fn run<F>(&self, stage: &'static str, work: F) -> F::Output
    where
        F: Future,
    {
        let _guard = self.acquire(stage).await;
        Self::execute(stage, work).await
    }

    /// Like [`run`](Self::run), but gives up without starting `work` when
    /// `cancel` fired while this run was waiting for the gate.
    pub async fn run_unless_cancelled<F>(
        &self,
        stage: &'static str,
        cancel: &CancellationToken,
        work: F,
    ) -> Option<F::Output>
    where
        F: Future,
    {
        let _guard = self.acquire(stage).await;
        if cancel.is_cancelled() {
            tracing::info!(stage, "Shutdown requested while waiting, skipping scheduled run");
            return None;
        }
        Some(Self::execute(stage, work).await)
    }

    async fn acquire(&self, stage: &'static str) -> Option<MutexGuard<'_, ()>> {
        tracing::info!(stage, "Attempting to start scheduled run");
        match &self.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    async fn execute<F>(stage: &'static str, work: F) -> F::Output
    where
        F: Future,
    {
        tracing::info!(stage, "Running scheduled stage");
        let output = work.await;
        tracing::info!(stage, "Finished scheduled stage");
        output
    }
}

pub struct Scheduler {
    submission: Arc<SubmissionStage>,
    polling: Arc<PollingStage>,
    cancel: CancellationToken,
    submission_tick: Duration,
    polling_tick: Duration,
}

impl Scheduler {
    pub fn new(
        submission: Arc<SubmissionStage>,
        polling: Arc<PollingStage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            submission,
            polling,
            cancel,
            submission_tick: SUBMISSION_TICK,
            polling_tick: POLLING_TICK,
        }
    }

    /// Override the continuous-mode ticks.
    pub fn with_ticks(mut self, submission: Duration, polling: Duration) -> Self {
        self.submission_tick = submission;
        self.polling_tick = polling;
        self
    }

    /// Run the selected stages on fixed ticks until cancelled.
    pub async fn run_continuous(&self, stages: StageSelection) {
        let mut tasks = JoinSet::new();

        if stages.generator {
            tracing::info!("Starting image generation workflow");
            tasks.spawn(submission_loop(
                self.submission.clone(),
                self.submission_tick,
                self.cancel.clone(),
            ));
        }
        if stages.processor {
            tracing::info!("Starting image processing workflow");
            tasks.spawn(polling_loop(
                self.polling.clone(),
                self.polling_tick,
                self.cancel.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Workflow task panicked");
            }
        }
    }

    /// Run both stages from cron expressions until cancelled.
    pub async fn run_calendar(&self, schedule: &CalendarSchedule) -> Result<(), SchedulerError> {
        let gate = StageGate::new(schedule.serialize_stages);
        // Every firing holds a read guard; shutdown takes the write side to
        // wait for in-flight runs.
        let in_flight = Arc::new(RwLock::new(()));

        let mut cron = JobScheduler::new().await?;

        let submission = self.submission.clone();
        let generator_gate = gate.clone();
        let generator_cancel = self.cancel.clone();
        let generator_in_flight = in_flight.clone();
        let generator_job = Job::new_async(schedule.generator.as_str(), move |_uuid, _lock| {
            let stage = submission.clone();
            let gate = generator_gate.clone();
            let cancel = generator_cancel.clone();
            let in_flight = generator_in_flight.clone();
            Box::pin(async move {
                let _running = in_flight.read().await;
                if cancel.is_cancelled() {
                    return;
                }
                match gate
                    .run_unless_cancelled("generator", &cancel, stage.run_batch())
                    .await
                {
                    Some(Ok(count)) => tracing::debug!(count, "Generator pass complete"),
                    Some(Err(e)) => tracing::error!(error = %e, "Error getting ready jobs"),
                    None => {}
                }
            })
        })?;
        cron.add(generator_job).await?;

        let polling = self.polling.clone();
        let processor_gate = gate.clone();
        let processor_cancel = self.cancel.clone();
        let processor_in_flight = in_flight.clone();
        let processor_job = Job::new_async(schedule.processor.as_str(), move |_uuid, _lock| {
            let stage = polling.clone();
            let gate = processor_gate.clone();
            let cancel = processor_cancel.clone();
            let in_flight = processor_in_flight.clone();
            Box::pin(async move {
                let _running = in_flight.read().await;
                if cancel.is_cancelled() {
                    return;
                }
                match gate
                    .run_unless_cancelled("processor", &cancel, stage.run_batch())
                    .await
                {
                    Some(Ok(count)) => tracing::debug!(count, "Processor pass complete"),
                    Some(Err(e)) => tracing::error!(error = %e, "Error getting jobs ready for check"),
                    None => {}
                }
            })
        })?;
        cron.add(processor_job).await?;

        cron.start().await?;
        tracing::info!(
            generator = %schedule.generator,
            processor = %schedule.processor,
            serialized = gate.is_serialized(),
            "Cron scheduler started"
        );

        self.cancel.cancelled().await;
        cron.shutdown().await?;
        let _drained = in_flight.write().await;
        tracing::info!("Cron scheduler stopped");
        Ok(())
    }
}

async fn submission_loop(stage: Arc<SubmissionStage>, tick: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Image generation workflow stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = stage.run_next().await {
            tracing::error!(error = %e, "Error getting ready jobs");
        }
    }
}

async fn polling_loop(stage: Arc<PollingStage>, tick: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Image processing workflow stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = stage.run_batch().await {
            tracing::error!(error = %e, "Error getting jobs ready for check");
        }
    }
}
