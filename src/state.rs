//! Application state shared across the web handlers and services.

use crate::status::ServiceStatusRegistry;
use crate::store::ObjectStore;
use crate::worker::WorkerPool;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub object_store: Arc<dyn ObjectStore>,
    /// `None` until the worker service has been wired up; the control
    /// surface answers 503 for worker routes in that window.
    pub worker_pool: Option<Arc<WorkerPool>>,
    pub service_statuses: ServiceStatusRegistry,
    pub started_at: DateTime<Utc>,
    /// Retry budget applied to jobs enqueued over HTTP.
    pub default_max_attempts: i32,
    /// Timeout used when the control surface stops the worker pool.
    pub shutdown_timeout: Duration,
}

impl AppState {
    pub fn new(
        db_pool: PgPool,
        object_store: Arc<dyn ObjectStore>,
        worker_pool: Option<Arc<WorkerPool>>,
        default_max_attempts: i32,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            db_pool,
            object_store,
            worker_pool,
            service_statuses: ServiceStatusRegistry::new(),
            started_at: Utc::now(),
            default_max_attempts,
            shutdown_timeout,
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
