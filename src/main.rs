use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use image_gen_queue::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes::{self, metrics::MetricsState},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(false);

    let config = AppConfig::from_env().context("Failed to load configuration from environment")?;

    tracing::info!("Initializing image-gen-queue server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")?;

    metrics::describe_counter!("image_jobs_created_total", "Jobs created through the API");
    metrics::describe_gauge!("image_jobs", "Current number of jobs per status");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .context("Failed to run database migrations")?;

    let state = AppState::new(db_pool.clone());

    let metrics_state = MetricsState {
        handle: Arc::new(prometheus_handle),
        db: db_pool,
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/jobs", post(routes::jobs::create_job))
        .route("/api/v1/jobs/{id}", get(routes::jobs::get_job_status))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Server error")?;

    Ok(())
}
