use super::ApiError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pixelfleet_engine::Engine;
use serde_json::json;
use std::sync::Arc;

/// `GET /health` - 200 when at least one worker is healthy and the scheduler
/// is running, 503 otherwise. The body carries the worker table and the
/// headline KPIs either way.
pub async fn health(State(engine): State<Arc<Engine>>) -> Response {
    let healthy_workers = engine.healthy_worker_count();
    let scheduler_running = engine.scheduler_running();
    let healthy = healthy_workers > 0 && scheduler_running;

    let metrics = engine.metrics_snapshot();
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "healthy_workers": healthy_workers,
        "scheduler_running": scheduler_running,
        "in_flight": engine.in_flight(),
        "workers": engine.worker_snapshots().await,
        "kpis": {
            "jobs_created": metrics.jobs_created,
            "jobs_completed": metrics.jobs_completed,
            "jobs_failed": metrics.jobs_failed,
            "p50_secs": metrics.processing_time.p50_secs,
            "p95_secs": metrics.processing_time.p95_secs,
        },
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

/// `GET /status` - uptime, effective limits, worker table, job counts.
pub async fn status(State(engine): State<Arc<Engine>>) -> Response {
    let config = engine.config();
    let stats = engine.job_stats();
    Json(json!({
        "uptime_secs": engine.uptime().as_secs(),
        "scheduler_running": engine.scheduler_running(),
        "in_flight": engine.in_flight(),
        "limits": {
            "max_concurrent_global": config.max_concurrent_global,
            "max_jobs_per_worker": config.max_jobs_per_worker,
            "max_streams_per_worker": config.max_streams_per_worker,
            "job_timeout_secs": config.job_timeout_secs,
            "execution_timeout_secs": config.execution_timeout_secs,
        },
        "workers": engine.worker_snapshots().await,
        "jobs": {
            "total": stats.total,
            "by_state": stats.by_state,
        },
    }))
    .into_response()
}

/// `GET /status/metrics` and `GET /api/metrics`.
pub async fn metrics(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.metrics_snapshot()).into_response()
}

/// `GET /api/circuit-breakers`
pub async fn breakers(State(engine): State<Arc<Engine>>) -> Response {
    Json(json!({ "breakers": engine.breaker_snapshots() })).into_response()
}

/// `POST /api/circuit-breakers/{name}/open`
pub async fn breaker_open(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !engine.force_breaker_open(&name) {
        return Err(ApiError::not_found(format!("unknown breaker: {name}")));
    }
    Ok(Json(json!({ "name": name, "state": "open" })).into_response())
}

/// `POST /api/circuit-breakers/{name}/close`
pub async fn breaker_close(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !engine.force_breaker_close(&name) {
        return Err(ApiError::not_found(format!("unknown breaker: {name}")));
    }
    Ok(Json(json!({ "name": name, "state": "closed" })).into_response())
}
