use super::Service;
use crate::alerts::Alerter;
use crate::queue;
use crate::state::AppState;
use crate::status::ServiceStatus;
use crate::worker::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Background scraping service: the worker pool plus queue maintenance.
///
/// Maintenance runs in its own loops so a stopped pool (via the control
/// surface) doesn't also stop lock-expiry recovery and cleanup.
pub struct WorkerService {
    app_state: AppState,
    pool: Arc<WorkerPool>,
    alerter: Arc<Alerter>,
    lock_ttl: Duration,
    cleanup_interval: Duration,
    cleanup_ttl: Duration,
    shutdown_timeout: Duration,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl WorkerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_state: AppState,
        pool: Arc<WorkerPool>,
        alerter: Arc<Alerter>,
        lock_ttl: Duration,
        cleanup_interval: Duration,
        cleanup_ttl: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            app_state,
            pool,
            alerter,
            lock_ttl,
            cleanup_interval,
            cleanup_ttl,
            shutdown_timeout,
            shutdown_tx: None,
        }
    }

    /// Re-queues expired leases on a timer.
    ///
    /// Dequeue already reclaims expired leases on its own, so this only
    /// shortens the window in which an abandoned job reads as `running`.
    async fn lock_expiry_loop(
        db_pool: sqlx::PgPool,
        lock_ttl: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let sweep_every = (lock_ttl / 2).max(Duration::from_secs(30));
        let mut interval = tokio::time::interval(sweep_every);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match queue::reap_expired(lock_ttl, &db_pool).await {
                        Ok(0) => {}
                        Ok(count) => warn!(count, "re-queued expired job leases"),
                        Err(e) => warn!(error = ?e, "lock expiry sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Watches process memory against the alerting high-water mark.
    async fn memory_watch_loop(alerter: Arc<Alerter>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = interval.tick() => alerter.check_memory(),
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Deletes finished jobs past their retention TTL.
    async fn cleanup_loop(
        db_pool: sqlx::PgPool,
        cleanup_interval: Duration,
        cleanup_ttl: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(cleanup_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match queue::cleanup_finished(cleanup_ttl, &db_pool).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "deleted finished jobs past retention"),
                        Err(e) => warn!(error = ?e, "job cleanup failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for WorkerService {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let db_pool = self.app_state.db_pool.clone();
        tokio::spawn(Self::lock_expiry_loop(
            db_pool.clone(),
            self.lock_ttl,
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(Self::cleanup_loop(
            db_pool,
            self.cleanup_interval,
            self.cleanup_ttl,
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(Self::memory_watch_loop(
            self.alerter.clone(),
            shutdown_tx.subscribe(),
        ));

        self.pool.start().await;
        self.app_state
            .service_statuses
            .set("worker", ServiceStatus::Active);

        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.app_state
            .service_statuses
            .set("worker", ServiceStatus::Disabled);
        info!("Shutting down worker service");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        self.pool.stop(self.shutdown_timeout).await;
        info!("Worker service shutdown complete");
        Ok(())
    }
}
