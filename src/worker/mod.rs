//! Concurrent pipeline workers drawing from the job queue.
//!
//! Each worker is a single-flight loop: lease a job, run the three-stage
//! pipeline (handler → image stage → catalog upsert), then report the
//! outcome back to the queue. Workers share nothing but the metrics record
//! and the shutdown signal; all contention happens through the queue's
//! skip-locked dequeue.

pub mod metrics;

use crate::alerts::Alerter;
use crate::catalog::{self, ScrapeResult};
use crate::error::{Result, ScrapeError};
use crate::handlers::PageHandlers;
use crate::images::ImagePipeline;
use crate::queue::{self, FailOutcome, JobType, ResultSummary, ScrapeJob};
use serde_json::json;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use metrics::{MetricsSnapshot, WorkerMetrics};

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub db_pool: PgPool,
    pub handlers: Arc<dyn PageHandlers>,
    pub images: Arc<ImagePipeline>,
    pub metrics: Arc<WorkerMetrics>,
    pub alerter: Arc<Alerter>,
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
}

/// Tracks one worker's currently leased job so the pool can release it if
/// the worker has to be hard-killed at shutdown.
type InFlightSlot = Arc<StdMutex<Option<Uuid>>>;

struct PoolState {
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
    in_flight: Vec<(String, InFlightSlot)>,
}

/// Start/stoppable pool of N pipeline workers.
pub struct WorkerPool {
    ctx: WorkerContext,
    concurrency: usize,
    state: Mutex<PoolState>,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, concurrency: usize) -> Self {
        Self {
            ctx,
            concurrency: concurrency.max(1),
            state: Mutex::new(PoolState {
                shutdown_tx: None,
                handles: Vec::new(),
                in_flight: Vec::new(),
            }),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Spawn the worker tasks. Returns `false` when already running.
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return false;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        let pid = std::process::id();

        for index in 0..self.concurrency {
            let worker_id = format!("{hostname}-{pid}-w{index}");
            let current_job: InFlightSlot = Arc::new(StdMutex::new(None));
            state
                .in_flight
                .push((worker_id.clone(), current_job.clone()));

            let worker = Worker {
                id: index,
                worker_id,
                ctx: self.ctx.clone(),
                current_job,
            };
            let shutdown_rx = shutdown_tx.subscribe();
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                Box::pin(async move {
                    worker.run(shutdown_rx).await;
                });
            state.handles.push(tokio::spawn(fut));
        }

        state.shutdown_tx = Some(shutdown_tx);
        self.running.store(true, Ordering::SeqCst);
        info!(worker_count = self.concurrency, "worker pool started");
        true
    }

    /// Signal shutdown and wait up to `timeout` for in-flight jobs.
    ///
    /// Workers that overrun the deadline are aborted and their leases
    /// released back to the queue; anything the release itself misses is
    /// recovered by lock expiry. Returns `false` when not running.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }

        if let Some(shutdown_tx) = state.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = 0usize;
        for handle in std::mem::take(&mut state.handles) {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(error = ?e, "worker task panicked during shutdown"),
                Err(_) => {
                    abort.abort();
                    aborted += 1;
                }
            }
        }

        // Hard-killed workers never cleared their in-flight slot; release
        // those leases so the jobs re-enter the queue without waiting out
        // the lock TTL.
        for (worker_id, slot) in state.in_flight.drain(..) {
            let held = slot.lock().expect("in-flight slot lock poisoned").take();
            if let Some(job_id) = held {
                match queue::release(job_id, &worker_id, &self.ctx.db_pool).await {
                    Ok(true) => info!(%job_id, worker = %worker_id, "released lease at shutdown"),
                    Ok(false) => {}
                    Err(e) => warn!(%job_id, error = ?e, "failed to release lease at shutdown"),
                }
            }
        }

        if aborted > 0 {
            warn!(aborted, "worker task(s) exceeded shutdown deadline");
        }
        self.running.store(false, Ordering::SeqCst);
        info!("worker pool stopped");
        true
    }
}

/// A single worker instance.
///
/// Each worker runs in its own asynchronous task and continuously polls the
/// queue for jobs to execute.
struct Worker {
    id: usize,
    worker_id: String,
    ctx: WorkerContext,
    current_job: InFlightSlot,
}

impl Worker {
    /// Runs the worker's main loop until shutdown is signalled.
    async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(worker_id = self.id, "Worker started");
        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(_) => {}
            }

            match queue::dequeue(&self.worker_id, self.ctx.lock_ttl, &self.ctx.db_pool).await {
                Ok(Some(job)) => {
                    *self.current_job.lock().expect("in-flight slot lock poisoned") = Some(job.id);
                    Box::pin(self.run_job(job)).await;
                    *self.current_job.lock().expect("in-flight slot lock poisoned") = None;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = time::sleep(self.ctx.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id = self.id, error = ?e, "Failed to fetch job");
                    // Wait before retrying to avoid spamming errors.
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = time::sleep(self.ctx.poll_interval * 2) => {}
                    }
                }
            }
        }
        info!(worker_id = self.id, "Worker stopped");
    }

    /// Run the pipeline for one leased job and report the outcome.
    ///
    /// Every error is converted into a queue transition here; nothing
    /// propagates past this boundary.
    async fn run_job(&self, job: ScrapeJob) {
        let started = Instant::now();
        let job_id = job.id;
        debug!(worker_id = self.id, %job_id, job_type = job.job_type.as_str(), "Processing job");

        match self.process_job(&job).await {
            Ok(summary) => {
                match queue::complete(job_id, &self.worker_id, &summary, &self.ctx.db_pool).await {
                    Ok(()) => {
                        debug!(
                            worker_id = self.id,
                            %job_id,
                            items = summary.items_processed,
                            image_errors = summary.errors.len(),
                            "Job completed"
                        );
                        self.ctx.metrics.record_success(started.elapsed());
                        self.ctx.alerter.record_outcome(true);
                    }
                    Err(e) if is_lost_lease(&e) => {
                        debug!(worker_id = self.id, %job_id, "Lease lost before completion");
                    }
                    Err(e) => {
                        error!(worker_id = self.id, %job_id, error = ?e, "Failed to mark job complete");
                    }
                }
            }
            Err(e) if is_lost_lease(&e) => {
                debug!(worker_id = self.id, %job_id, "Lease lost mid-pipeline");
            }
            Err(e) => {
                let error_text = format!("{e:#}");
                error!(worker_id = self.id, %job_id, error = %error_text, "Failed to process job");

                match queue::fail(job_id, &self.worker_id, &error_text, None, &self.ctx.db_pool)
                    .await
                {
                    Ok(FailOutcome::Requeued) => {
                        debug!(worker_id = self.id, %job_id, "Job requeued for retry");
                    }
                    Ok(FailOutcome::Dead) => {
                        warn!(worker_id = self.id, %job_id, "Job exhausted its attempts");
                        self.ctx
                            .alerter
                            .job_dead(job_id, job.job_type.as_str(), &error_text);
                    }
                    Err(fail_err) if is_lost_lease(&fail_err) => {
                        debug!(worker_id = self.id, %job_id, "Lease lost before failure was recorded");
                    }
                    Err(fail_err) => {
                        error!(worker_id = self.id, %job_id, error = ?fail_err, "Failed to record job failure");
                    }
                }

                self.ctx.metrics.record_failure(started.elapsed());
                self.ctx.alerter.record_outcome(false);
            }
        }
    }

    /// The three-stage pipeline: handler dispatch, image materialization,
    /// catalog persistence. Image failures land in the summary's error list
    /// without failing the job; everything else propagates.
    async fn process_job(&self, job: &ScrapeJob) -> Result<ResultSummary> {
        let started = Instant::now();
        let mut errors: Vec<String> = Vec::new();
        let mut result = ScrapeResult::default();

        match job.job_type {
            JobType::Navigation => {
                let records = self.ctx.handlers.handle_navigation(job).await?;
                let urls = records.iter().map(|r| r.source_url.clone()).collect();
                self.enqueue_followups(JobType::Category, urls, job).await?;
                result.navigations = records;
            }
            JobType::Category => {
                let (category, products) = self.ctx.handlers.handle_category(job).await?;
                let urls = products.iter().map(|p| p.url.clone()).collect();
                self.enqueue_followups(JobType::Product, urls, job).await?;
                result.categories = vec![category];
            }
            JobType::Product => {
                let mut record = self.ctx.handlers.handle_product(job).await?;
                let (canonical, image_errors) =
                    self.materialize_images(&record.image_urls).await;
                record.image_urls = canonical;
                errors.extend(image_errors);
                result.products = vec![record];
            }
        }

        let counts = catalog::upsert_scrape_result(&result, &self.ctx.db_pool).await?;

        Ok(ResultSummary {
            items_processed: counts.total(),
            duration_ms: started.elapsed().as_millis() as i64,
            errors,
            completed_by: Some(self.worker_id.clone()),
        })
    }

    /// Replace origin image URLs with canonical object-store URLs,
    /// collecting per-image failures as warnings.
    async fn materialize_images(&self, urls: &[String]) -> (Vec<String>, Vec<String>) {
        if urls.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let outcomes = self.ctx.images.process_batch(urls).await;
        let mut canonical = Vec::with_capacity(urls.len());
        let mut errors = Vec::new();

        for (origin, outcome) in urls.iter().zip(outcomes) {
            match outcome {
                Ok(stored) => canonical.push(stored.canonical_url),
                Err(e) => {
                    warn!(worker_id = self.id, image = %origin, error = %format!("{e:#}"), "Image failed");
                    errors.push(format!("{origin}: {e:#}"));
                }
            }
        }

        (canonical, errors)
    }

    /// Enqueue follow-up jobs for URLs discovered on this page, skipping
    /// targets that already have a pending or running job.
    async fn enqueue_followups(
        &self,
        job_type: JobType,
        urls: Vec<String>,
        parent: &ScrapeJob,
    ) -> Result<usize> {
        if urls.is_empty() {
            return Ok(0);
        }

        let existing =
            queue::find_existing_targets(job_type, &urls, &self.ctx.db_pool).await?;

        let mut enqueued = 0usize;
        for url in urls {
            if existing.contains(&url) {
                continue;
            }
            queue::enqueue(
                job_type,
                &url,
                parent.priority,
                json!({ "discovered_by": parent.id }),
                parent.max_attempts,
                &self.ctx.db_pool,
            )
            .await?;
            enqueued += 1;
        }

        if enqueued > 0 {
            debug!(
                worker_id = self.id,
                job_type = job_type.as_str(),
                count = enqueued,
                "Enqueued follow-up jobs"
            );
        }
        Ok(enqueued)
    }
}

fn is_lost_lease(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<ScrapeError>(),
        Some(ScrapeError::LostLease { .. })
    )
}
