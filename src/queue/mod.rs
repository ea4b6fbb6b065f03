//! Database operations for the scrape job queue.
//!
//! Delivery is at-least-once: a lease (row-level lock plus `locked_by`
//! identity) is the sole license to transition a `running` job, and every
//! worker-side mutation repeats that identity in its predicate. An update
//! that matches no rows means the lease was lost to the expiry path and the
//! caller must abandon the job.

pub mod models;

use crate::error::{Result, ScrapeError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub use models::{JobStatus, JobType, QueueStats, ResultSummary, ScrapeJob};

/// Outcome of [`fail`]: whether the job went back to the queue or hit its
/// attempt ceiling and is now terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    Dead,
}

/// Validate and insert a new job in `queued` state.
///
/// The target URL must be absolute http(s); anything else is rejected before
/// touching the store so the worker never sees an unprocessable job.
pub async fn enqueue(
    job_type: JobType,
    target_url: &str,
    priority: i32,
    metadata: Value,
    max_attempts: i32,
    db_pool: &PgPool,
) -> Result<Uuid> {
    let parsed = Url::parse(target_url)
        .map_err(|e| ScrapeError::validation("target_url", e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ScrapeError::validation(
            "target_url",
            format!("unsupported scheme: {}", parsed.scheme()),
        )
        .into());
    }
    if max_attempts < 1 {
        return Err(ScrapeError::validation("max_attempts", "must be at least 1").into());
    }

    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO scrape_job (job_type, target_url, priority, metadata, max_attempts)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id",
    )
    .bind(job_type)
    .bind(parsed.as_str())
    .bind(priority)
    .bind(&metadata)
    .bind(max_attempts)
    .fetch_one(db_pool)
    .await?;

    Ok(id)
}

/// Atomically lease the next eligible job for `worker_id`.
///
/// Delegates to the `dequeue_job` stored procedure, which selects the
/// highest-priority oldest row that is queued or expired-with-attempts-left
/// under `FOR UPDATE SKIP LOCKED`, marks it running, and counts the
/// attempt. An expired row at its attempt ceiling is left for
/// [`reap_expired`] to fail; re-leasing it would break the
/// `attempts <= max_attempts` invariant.
///
/// # Returns
/// * `Ok(Some(job))` if a job was leased
/// * `Ok(None)` if the queue has nothing eligible
pub async fn dequeue(
    worker_id: &str,
    lock_ttl: Duration,
    db_pool: &PgPool,
) -> Result<Option<ScrapeJob>> {
    let job = sqlx::query_as::<_, ScrapeJob>("SELECT * FROM dequeue_job($1, $2)")
        .bind(worker_id)
        .bind(lock_ttl.as_secs() as f64)
        .fetch_optional(db_pool)
        .await?;

    Ok(job)
}

/// Mark a leased job completed, merging the result summary into its metadata.
///
/// The ownership check is part of the update predicate; if another claimant
/// took the lease in the meantime this returns [`ScrapeError::LostLease`].
pub async fn complete(
    job_id: Uuid,
    worker_id: &str,
    summary: &ResultSummary,
    db_pool: &PgPool,
) -> Result<()> {
    let summary_json = serde_json::to_value(summary)?;
    let result = sqlx::query(
        "UPDATE scrape_job
         SET status = 'completed',
             locked_at = NULL,
             locked_by = NULL,
             completed_at = NOW(),
             updated_at = NOW(),
             metadata = metadata || $3
         WHERE id = $1 AND locked_by = $2 AND status = 'running'",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(&summary_json)
    .execute(db_pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ScrapeError::LostLease { job_id }.into());
    }
    Ok(())
}

/// Record a failed attempt on a leased job.
///
/// The retry decision is made atomically in SQL from the row's own
/// `attempts`/`max_attempts`: below the ceiling the job returns to `queued`
/// (immediately re-dequeuable, no backoff), at the ceiling it becomes
/// terminal `failed`. Partial progress, if any, is merged into metadata so
/// the next attempt's idempotent upserts can be audited.
pub async fn fail(
    job_id: Uuid,
    worker_id: &str,
    error: &str,
    partial: Option<&ResultSummary>,
    db_pool: &PgPool,
) -> Result<FailOutcome> {
    let partial_json = match partial {
        Some(summary) => serde_json::to_value(summary)?,
        None => Value::Object(Default::default()),
    };

    let status = sqlx::query_scalar::<_, JobStatus>(
        "UPDATE scrape_job
         SET status = CASE WHEN attempts < max_attempts
                           THEN 'queued'::scrape_job_status
                           ELSE 'failed'::scrape_job_status END,
             locked_at = NULL,
             locked_by = NULL,
             last_error = $3,
             metadata = metadata || $4,
             completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
             updated_at = NOW()
         WHERE id = $1 AND locked_by = $2 AND status = 'running'
         RETURNING status",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(error)
    .bind(&partial_json)
    .fetch_optional(db_pool)
    .await?;

    match status {
        Some(JobStatus::Queued) => Ok(FailOutcome::Requeued),
        Some(_) => Ok(FailOutcome::Dead),
        None => Err(ScrapeError::LostLease { job_id }.into()),
    }
}

/// Release a held lease back to `queued` without recording a failure.
///
/// Used during graceful shutdown for jobs that were leased but not finished.
/// The attempt consumed by the dequeue stands.
pub async fn release(job_id: Uuid, worker_id: &str, db_pool: &PgPool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scrape_job
         SET status = 'queued', locked_at = NULL, locked_by = NULL, updated_at = NOW()
         WHERE id = $1 AND locked_by = $2 AND status = 'running'",
    )
    .bind(job_id)
    .bind(worker_id)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Per-status counts plus the number of currently held leases.
pub async fn get_stats(db_pool: &PgPool) -> Result<QueueStats> {
    let stats = sqlx::query_as::<_, QueueStats>(
        "SELECT
            COUNT(*) FILTER (WHERE status = 'queued') AS queued,
            COUNT(*) FILTER (WHERE status = 'running') AS running,
            COUNT(*) FILTER (WHERE status = 'completed') AS completed,
            COUNT(*) FILTER (WHERE status = 'failed') AS failed,
            COUNT(*) FILTER (WHERE locked_at IS NOT NULL) AS locked
         FROM scrape_job",
    )
    .fetch_one(db_pool)
    .await?;

    Ok(stats)
}

/// Failed jobs that still have attempts left, eligible for manual requeue.
pub async fn get_retryable(limit: i32, db_pool: &PgPool) -> Result<Vec<ScrapeJob>> {
    let jobs = sqlx::query_as::<_, ScrapeJob>("SELECT * FROM get_retryable_jobs($1)")
        .bind(limit)
        .fetch_all(db_pool)
        .await?;

    Ok(jobs)
}

/// Put a retryable `failed` job back in the queue.
///
/// Returns `false` when the job is not failed or has exhausted its attempts.
pub async fn requeue(job_id: Uuid, db_pool: &PgPool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scrape_job
         SET status = 'queued', completed_at = NULL, updated_at = NOW()
         WHERE id = $1 AND status = 'failed' AND attempts < max_attempts",
    )
    .bind(job_id)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Resolve running jobs whose lease expired.
///
/// An expiry counts as a failed attempt: rows with attempts left go back to
/// `queued` (dequeue would also reclaim those on its own, so that half is
/// an optimization that makes abandoned jobs visible sooner), while rows
/// already at their attempt ceiling become terminal `failed` — they are the
/// one case dequeue must not touch, since re-leasing would push `attempts`
/// past `max_attempts`. The comparison is inclusive, matching `dequeue_job`.
pub async fn reap_expired(lock_ttl: Duration, db_pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE scrape_job
         SET status = CASE WHEN attempts < max_attempts
                           THEN 'queued'::scrape_job_status
                           ELSE 'failed'::scrape_job_status END,
             locked_at = NULL,
             locked_by = NULL,
             last_error = CASE WHEN attempts < max_attempts
                               THEN last_error
                               ELSE 'lease expired' END,
             completed_at = CASE WHEN attempts < max_attempts THEN completed_at ELSE NOW() END,
             updated_at = NOW()
         WHERE status = 'running'
           AND locked_at <= NOW() - make_interval(secs => $1::double precision)",
    )
    .bind(lock_ttl.as_secs() as f64)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete completed/failed jobs older than `ttl`.
pub async fn cleanup_finished(ttl: Duration, db_pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM scrape_job
         WHERE status IN ('completed', 'failed')
           AND completed_at IS NOT NULL
           AND completed_at < NOW() - make_interval(secs => $1::double precision)",
    )
    .bind(ttl.as_secs() as f64)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected())
}

/// Find which of the candidate target URLs already have a pending or
/// in-flight job of the given type.
///
/// Used to deduplicate follow-up jobs discovered on navigation and category
/// pages before enqueueing them.
pub async fn find_existing_targets(
    job_type: JobType,
    urls: &[String],
    db_pool: &PgPool,
) -> Result<std::collections::HashSet<String>> {
    if urls.is_empty() {
        return Ok(Default::default());
    }

    let existing: Vec<(String,)> = sqlx::query_as(
        "SELECT target_url FROM scrape_job
         WHERE job_type = $1 AND target_url = ANY($2) AND status IN ('queued', 'running')",
    )
    .bind(job_type)
    .bind(urls)
    .fetch_all(db_pool)
    .await?;

    Ok(existing.into_iter().map(|(url,)| url).collect())
}

/// Point lookup for the control surface.
pub async fn get_job(job_id: Uuid, db_pool: &PgPool) -> Result<Option<ScrapeJob>> {
    let job = sqlx::query_as::<_, ScrapeJob>("SELECT * FROM scrape_job WHERE id = $1")
        .bind(job_id)
        .fetch_optional(db_pool)
        .await?;

    Ok(job)
}

/// Timestamp of the most recent queue activity, used by detailed health.
pub async fn last_activity(db_pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let ts = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MAX(updated_at) FROM scrape_job",
    )
    .fetch_one(db_pool)
    .await?;

    Ok(ts)
}
