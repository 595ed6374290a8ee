use anyhow::{bail, Context};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use image_gen_queue::{
    config::AppConfig,
    db::{
        self,
        store::{JobStore, PgJobStore},
    },
    services::{
        generation::{FusionBrainClient, GenerationClient},
        polling::{PollPolicy, PollingStage},
        scheduler::{CalendarSchedule, Scheduler, StageSelection},
        submission::SubmissionStage,
    },
    telemetry,
};

#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "Submits pending prompts and polls generations back into the job table")]
struct Cli {
    /// Run the image generation (submission) workflow
    #[arg(long)]
    generator: bool,

    /// Run the image processing (polling) workflow
    #[arg(long)]
    processor: bool,

    /// Run both workflows on their cron schedules instead of fixed ticks
    #[arg(long)]
    cron: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);

    if !cli.generator && !cli.processor && !cli.cron {
        bail!("Please specify at least one workflow to run: --generator, --processor, or --cron");
    }

    tracing::info!("Loading configuration");
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    if let Some(addr) = cli.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        tracing::info!(%addr, "Serving metrics");
    }
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config)
        .await
        .context("Failed to connect to database")?;

    let worker_id = format!("worker-{}", Uuid::new_v4());
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(
        db_pool,
        worker_id.clone(),
        config.claim_lease(),
        config.claim_batch_size,
    ));
    let generation: Arc<dyn GenerationClient> = Arc::new(
        FusionBrainClient::from_config(&config)
            .context("Failed to initialize FusionBrain client")?,
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let submission = SubmissionStage::new(
        store.clone(),
        generation.clone(),
        config.generation_defaults(),
    );
    let polling = PollingStage::new(store, generation, PollPolicy::default(), cancel.clone());
    let scheduler = Scheduler::new(Arc::new(submission), Arc::new(polling), cancel.clone());

    tracing::info!(worker_id = %worker_id, "Worker ready");

    if cli.cron {
        let schedule = CalendarSchedule {
            generator: config.generator_schedule.clone(),
            processor: config.processor_schedule.clone(),
            serialize_stages: config.serialize_stages,
        };
        scheduler
            .run_calendar(&schedule)
            .await
            .context("Cron scheduler failed")?;
    } else {
        scheduler
            .run_continuous(StageSelection {
                generator: cli.generator,
                processor: cli.processor,
            })
            .await;
    }

    tracing::info!("Shut down gracefully");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("image_jobs_submitted_total", "Jobs accepted by the generation API");
    metrics::describe_counter!(
        "image_jobs_submit_failed_total",
        "Jobs whose submission was rejected"
    );
    metrics::describe_counter!("image_jobs_completed_total", "Jobs moved to ReadyToPublish");
    metrics::describe_counter!("image_jobs_failed_total", "Jobs the generation API reported failed");
    metrics::describe_counter!(
        "image_jobs_reset_total",
        "Jobs reset after the generation API lost their correlation id"
    );
    metrics::describe_counter!("image_jobs_poll_errors_total", "Failed status checks");
    metrics::describe_histogram!(
        "image_job_stage_seconds",
        "Time spent processing one job in a stage"
    );
}

/// Cancel on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received SIGINT, initiating shutdown"),
            _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
        }
        cancel.cancel();
    });
}
