use super::{job_status_json, ApiError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pixelfleet_common::job::{JobId, JobKind, JobState};
use pixelfleet_engine::{Engine, JobFilter};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid job id: {raw}")))
}

/// `GET /api/jobs/{id}/status`
pub async fn status(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let job = engine
        .job(id)
        .ok_or_else(|| ApiError::not_found(format!("unknown job: {id}")))?;
    Ok(Json(job_status_json(&job)).into_response())
}

/// `GET /api/jobs/{id}/result` - the payload once completed, an error shape
/// otherwise.
pub async fn result(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let job = engine
        .job(id)
        .ok_or_else(|| ApiError::not_found(format!("unknown job: {id}")))?;

    match job.state {
        JobState::Completed => {
            let result = job.result.as_ref().ok_or_else(|| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "completed job without result")
            })?;
            Ok(Json(json!({
                "id": job.id.to_string(),
                "state": job.state.as_str(),
                "image": result.image,
                "content_type": result.content_type,
                "filename": result.filename,
                "prompt_id": result.prompt_id,
            }))
            .into_response())
        }
        JobState::Failed => {
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(job_status_json(&job))).into_response())
        }
        _ => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "id": job.id.to_string(),
                "state": job.state.as_str(),
                "error": "result not ready",
            })),
        )
            .into_response()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub kind: Option<String>,
    pub worker: Option<String>,
}

/// `GET /api/jobs/list?state=&kind=&worker=`
pub async fn list(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let filter = JobFilter {
        state: query
            .state
            .as_deref()
            .map(str::parse::<JobState>)
            .transpose()?,
        kind: query
            .kind
            .as_deref()
            .map(str::parse::<JobKind>)
            .transpose()?,
        worker: query.worker,
    };
    let jobs: Vec<_> = engine.jobs(&filter).iter().map(job_status_json).collect();
    Ok(Json(json!({ "count": jobs.len(), "jobs": jobs })).into_response())
}

/// `DELETE /api/jobs/{id}` - idempotent.
pub async fn delete(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let deleted = engine.delete_job(id);
    Ok(Json(json!({ "id": id.to_string(), "deleted": deleted })).into_response())
}

/// `POST /api/jobs/cleanup` - evicts all terminal jobs now; idempotent.
pub async fn cleanup(State(engine): State<Arc<Engine>>) -> Response {
    let removed = engine.cleanup_jobs();
    Json(json!({ "removed": removed })).into_response()
}

/// `GET /api/jobs/stats`
pub async fn stats(State(engine): State<Arc<Engine>>) -> Response {
    let stats = engine.job_stats();
    Json(json!({
        "total": stats.total,
        "in_flight": engine.in_flight(),
        "by_state": stats.by_state,
        "by_kind": stats.by_kind,
        "by_worker": stats.by_worker,
    }))
    .into_response()
}
