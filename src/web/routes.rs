//! HTTP control surface: health, metrics, job enqueue and worker lifecycle.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tower_http::{
    classify::ServerErrorsFailureClass, compression::CompressionLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{Span, debug, trace, warn};
use uuid::Uuid;

use crate::queue::{self, JobType};
use crate::state::AppState;
use crate::web::error::{ApiError, db_error};

/// Creates the web server router
pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        .route("/metrics", get(metrics))
        .route("/jobs", post(enqueue_job))
        .route("/jobs/retryable", get(list_retryable))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/requeue", post(requeue_job))
        .route("/worker/start", post(worker_start))
        .route("/worker/stop", post(worker_stop))
        .route("/worker/status", get(worker_status))
        .fallback(fallback)
        .with_state(app_state)
        .layer((
            CompressionLayer::new(),
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| {
                    tracing::debug_span!("request", path = request.uri().path())
                })
                .on_request(())
                .on_body_chunk(())
                .on_eos(())
                .on_response(
                    |response: &axum::response::Response, latency: Duration, _span: &Span| {
                        debug!(
                            latency = format!("{latency:.2?}"),
                            status = response.status().as_u16(),
                            "Response"
                        );
                    },
                )
                .on_failure(
                    |error: ServerErrorsFailureClass, latency: Duration, _span: &Span| {
                        warn!(
                            error = ?error,
                            latency = format!("{latency:.2?}"),
                            "Request failed"
                        );
                    },
                ),
            TimeoutLayer::new(Duration::from_secs(10)),
        ))
}

/// JSON 404 for anything that isn't a known route.
async fn fallback() -> ApiError {
    ApiError::not_found("unknown route")
}

/// Liveness plus basic process stats.
async fn health(State(state): State<AppState>) -> Json<Value> {
    trace!("health check requested");
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("GIT_COMMIT_HASH"),
        "uptime_seconds": state.uptime_seconds(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Liveness plus downstream checks; 503 when any downstream fails.
async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let database = match sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db_pool)
        .await
    {
        Ok(_) => json!({ "ok": true }),
        Err(e) => {
            warn!(error = %e, "database health check failed");
            json!({ "ok": false, "error": e.to_string() })
        }
    };

    let object_store = match state.object_store.health_check().await {
        Ok(()) => json!({ "ok": true }),
        Err(e) => {
            warn!(error = %e, "object store health check failed");
            json!({ "ok": false, "error": e.to_string() })
        }
    };

    let queue_activity = match queue::last_activity(&state.db_pool).await {
        Ok(ts) => json!({ "ok": true, "last_activity": ts }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };

    let all_ok = [&database, &object_store, &queue_activity]
        .iter()
        .all(|check| check["ok"] == json!(true));

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if all_ok { "healthy" } else { "degraded" },
            "checks": {
                "database": database,
                "object_store": object_store,
                "queue": queue_activity,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn health_ready() -> Json<Value> {
    Json(json!({ "ready": true, "timestamp": chrono::Utc::now().to_rfc3339() }))
}

async fn health_live() -> Json<Value> {
    Json(json!({ "alive": true, "timestamp": chrono::Utc::now().to_rfc3339() }))
}

/// Worker and queue metrics.
async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let queue_stats = queue::get_stats(&state.db_pool)
        .await
        .map_err(|e| db_error("queue stats", e))?;

    let worker = state.worker_pool.as_ref().map(|pool| {
        json!({
            "running": pool.is_running(),
            "metrics": pool.metrics(),
        })
    });

    Ok(Json(json!({
        "queue": queue_stats,
        "worker": worker,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// Enqueue request body. Parsed from a raw JSON value so every shape
/// problem surfaces as a 400 with a field-level message.
fn parse_enqueue_request(body: &Value) -> Result<(JobType, String, i32, Value, Option<i32>), ApiError> {
    let job_type = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("missing field: type"))?
        .parse::<JobType>()
        .map_err(ApiError::bad_request)?;

    let target_url = body
        .get("target_url")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("missing field: target_url"))?
        .to_string();

    let priority = match body.get("priority") {
        None | Some(Value::Null) => 0,
        Some(value) => value
            .as_i64()
            .and_then(|p| i32::try_from(p).ok())
            .ok_or_else(|| ApiError::bad_request("priority must be an integer"))?,
    };

    let metadata = match body.get("metadata") {
        None | Some(Value::Null) => json!({}),
        Some(value @ Value::Object(_)) => value.clone(),
        Some(_) => return Err(ApiError::bad_request("metadata must be an object")),
    };

    let max_attempts = match body.get("max_attempts") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_i64()
                .and_then(|m| i32::try_from(m).ok())
                .ok_or_else(|| ApiError::bad_request("max_attempts must be an integer"))?,
        ),
    };

    Ok((job_type, target_url, priority, metadata, max_attempts))
}

/// `POST /jobs` — validate and enqueue a scrape job.
async fn enqueue_job(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let (job_type, target_url, priority, metadata, max_attempts) = parse_enqueue_request(&body)?;
    let max_attempts = max_attempts.unwrap_or(state.default_max_attempts);

    let job_id = queue::enqueue(
        job_type,
        &target_url,
        priority,
        metadata,
        max_attempts,
        &state.db_pool,
    )
    .await
    .map_err(|e| match e.downcast_ref::<crate::error::ScrapeError>() {
        Some(crate::error::ScrapeError::Validation { .. }) => {
            ApiError::bad_request(format!("{e:#}"))
        }
        _ => db_error("job enqueue", e),
    })?;

    debug!(%job_id, job_type = job_type.as_str(), "job enqueued via API");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "job_id": job_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let job = queue::get_job(id, &state.db_pool)
        .await
        .map_err(|e| db_error("job lookup", e))?
        .ok_or_else(|| ApiError::not_found(format!("no job with id {id}")))?;

    Ok(Json(json!({
        "job": job,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[derive(Deserialize)]
struct RetryableQuery {
    #[serde(default = "default_retryable_limit")]
    limit: i32,
}

fn default_retryable_limit() -> i32 {
    50
}

/// Failed jobs still under their attempt ceiling (the manually requeueable
/// part of the dead-letter set).
async fn list_retryable(
    State(state): State<AppState>,
    Query(query): Query<RetryableQuery>,
) -> Result<Json<Value>, ApiError> {
    let jobs = queue::get_retryable(query.limit.clamp(1, 500), &state.db_pool)
        .await
        .map_err(|e| db_error("retryable jobs", e))?;

    Ok(Json(json!({
        "jobs": jobs,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn requeue_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let requeued = queue::requeue(id, &state.db_pool)
        .await
        .map_err(|e| db_error("job requeue", e))?;

    if !requeued {
        return Err(ApiError::bad_request(
            "job is not failed or has exhausted its attempts",
        ));
    }

    Ok(Json(json!({
        "job_id": id,
        "requeued": true,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn worker_start(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = state
        .worker_pool
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("worker pool not initialized"))?;

    if !pool.start().await {
        return Err(ApiError::bad_request("worker already running"));
    }

    Ok(Json(json!({
        "status": "started",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn worker_stop(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = state
        .worker_pool
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("worker pool not initialized"))?;

    if !pool.stop(state.shutdown_timeout).await {
        return Err(ApiError::bad_request("worker already stopped"));
    }

    Ok(Json(json!({
        "status": "stopped",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn worker_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = state
        .worker_pool
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("worker pool not initialized"))?;

    let queue_stats = queue::get_stats(&state.db_pool)
        .await
        .map_err(|e| db_error("queue stats", e))?;

    Ok(Json(json!({
        "running": pool.is_running(),
        "metrics": pool.metrics(),
        "queue": queue_stats,
        "services": state
            .service_statuses
            .all()
            .into_iter()
            .collect::<std::collections::BTreeMap<_, _>>(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
