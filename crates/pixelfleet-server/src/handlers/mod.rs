pub mod jobs;
pub mod ops;
pub mod process;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pixelfleet_common::error::{ErrorKind, FleetError};
use pixelfleet_common::job::Job;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Uniform error response: a status code plus the user-visible error shape.
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let status = match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        match &err {
            FleetError::UnknownJob(id) => Self::not_found(format!("unknown job: {id}")),
            _ => Self::new(status, err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// The job-status shape shared by the status endpoint, the list endpoint and
/// the sync processing responses.
pub fn job_status_json(job: &Job) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("id".to_string(), json!(job.id.to_string()));
    obj.insert("state".to_string(), json!(job.state.as_str()));
    obj.insert("kind".to_string(), json!(job.kind.as_str()));
    obj.insert("created_time".to_string(), json!(unix_secs(job.created_at)));
    obj.insert(
        "updated_time".to_string(),
        json!(unix_secs(job.last_touched_at)),
    );

    if let Some(worker) = &job.assigned_worker {
        obj.insert("worker".to_string(), json!(worker));
    }
    if let Some(prompt_id) = &job.prompt_id {
        obj.insert("prompt_id".to_string(), json!(prompt_id));
    }
    if let Some(elapsed) = job.processing_time() {
        obj.insert(
            "processing_time_seconds".to_string(),
            json!(elapsed.as_secs_f64()),
        );
    }
    if let Some(error) = &job.error {
        obj.insert("error".to_string(), json!(error.message));
        let mut details = json!({ "kind": error.kind });
        if let Some(extra) = &error.details {
            details["data"] = extra.clone();
        }
        obj.insert("error_details".to_string(), details);
    }
    if job.result.is_some() {
        obj.insert("has_result".to_string(), json!(true));
    }
    Value::Object(obj)
}
