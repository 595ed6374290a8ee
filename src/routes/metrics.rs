use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;

use crate::db::queries;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub db: PgPool,
}

/// Prometheus metrics scrape endpoint.
/// Refreshes the per-status job gauges, then renders the text exposition.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match queries::count_by_status(&state.db).await {
        Ok(counts) => {
            for (status, count) in counts {
                metrics::gauge!("image_jobs", "status" => status.as_str()).set(count as f64);
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to refresh job gauges"),
    }

    state.handle.render()
}
