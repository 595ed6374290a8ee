use sqlx::PgPool;

/// Shared state passed to the HTTP route handlers.
///
/// Routes only read and create rows; the generation client and job
/// leases belong to the worker.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
}

impl AppState {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}
