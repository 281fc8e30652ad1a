use super::{job_status_json, ApiError};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pixelfleet_common::error::ErrorKind;
use pixelfleet_common::job::{ImageFormat, JobInput, JobKind, JobState};
use pixelfleet_engine::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Query parameters accepted alongside the multipart body; the same names
/// are honored as form fields.
#[derive(Debug, Default, Deserialize)]
pub struct ProcessQuery {
    pub format: Option<String>,
    pub crop: Option<String>,
    #[serde(rename = "async")]
    pub r#async: Option<String>,
    pub mode: Option<String>,
}

pub async fn remove_background(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ProcessQuery>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    handle_process(engine, JobKind::RemoveBackground, query, multipart).await
}

pub async fn upscale_image(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ProcessQuery>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    handle_process(engine, JobKind::Upscale, query, multipart).await
}

pub async fn upscale_remove_bg(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ProcessQuery>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    handle_process(engine, JobKind::UpscaleRemoveBackground, query, multipart).await
}

/// `POST /api/async/{kind}` - always asynchronous.
pub async fn submit_async(
    State(engine): State<Arc<Engine>>,
    Path(kind): Path<String>,
    Query(mut query): Query<ProcessQuery>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let kind: JobKind = kind.parse().map_err(ApiError::from)?;
    query.mode = Some("async".to_string());
    handle_process(engine, kind, query, multipart).await
}

struct UploadedRequest {
    input: JobInput,
    is_async: bool,
}

async fn handle_process(
    engine: Arc<Engine>,
    kind: JobKind,
    query: ProcessQuery,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let request = read_upload(kind, query, multipart).await?;
    let id = engine.submit(kind, request.input)?;
    debug!(job = %id, kind = %kind, r#async = request.is_async, "upload accepted");

    if request.is_async {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": id.to_string(),
                "state": JobState::Pending.as_str(),
                "status_url": format!("/api/jobs/{id}/status"),
                "result_url": format!("/api/jobs/{id}/result"),
            })),
        )
            .into_response());
    }

    // Synchronous: wait for a terminal state, bounded by the job deadline.
    let job = engine
        .wait_terminal(id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "job was evicted"))?;

    match job.state {
        JobState::Completed => {
            let result = job.result.clone().ok_or_else(|| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "completed job without result")
            })?;
            let mut body = job_status_json(&job);
            body["image"] = json!(result.image);
            body["content_type"] = json!(result.content_type);
            body["filename"] = json!(result.filename);
            Ok(Json(body).into_response())
        }
        JobState::Failed => {
            let status = match job.error.as_ref().map(|e| e.kind) {
                Some(ErrorKind::Validation) => StatusCode::BAD_REQUEST,
                Some(ErrorKind::BreakerOpen) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Ok((status, Json(job_status_json(&job))).into_response())
        }
        // The deadline expired while the job was still in flight.
        _ => Ok((StatusCode::GATEWAY_TIMEOUT, Json(job_status_json(&job))).into_response()),
    }
}

/// Collects the multipart upload, merging form fields over query parameters.
async fn read_upload(
    kind: JobKind,
    query: ProcessQuery,
    mut multipart: Multipart,
) -> Result<UploadedRequest, ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut format = query.format;
    let mut crop = query.crop;
    let mut is_async = is_truthy(query.r#async.as_deref())
        || query.mode.as_deref() == Some("async");

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "imageFile" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?;
                image = Some(bytes.to_vec());
            }
            "format" => format = read_text_field(field).await?,
            "crop" => crop = read_text_field(field).await?,
            "async" => {
                is_async = is_async || is_truthy(read_text_field(field).await?.as_deref());
            }
            "mode" => {
                is_async =
                    is_async || read_text_field(field).await?.as_deref() == Some("async");
            }
            other => {
                debug!("ignoring multipart field {other}");
            }
        }
    }

    let image = image
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing imageFile upload field"))?;

    let format = match format.as_deref() {
        Some(value) => value
            .parse::<ImageFormat>()
            .map_err(ApiError::from)?,
        None => ImageFormat::default(),
    };
    let crop = is_truthy(crop.as_deref());
    if crop && !kind.supports_crop() {
        debug!(kind = %kind, "crop requested for a pipeline that ignores it");
    }

    Ok(UploadedRequest {
        input: JobInput {
            image_b64: BASE64.encode(&image),
            format,
            crop,
        },
        is_async,
    })
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<Option<String>, ApiError> {
    let text = field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read field: {e}")))?;
    Ok(Some(text))
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1") | Some("yes") | Some("on"))
}
