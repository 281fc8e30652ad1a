use crate::error::{ErrorKind, FleetError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short prefix used in fingerprints and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The processing pipelines the middleware can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RemoveBackground,
    Upscale,
    UpscaleRemoveBackground,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RemoveBackground => "remove-background",
            JobKind::Upscale => "upscale",
            JobKind::UpscaleRemoveBackground => "upscale-remove-background",
        }
    }

    /// Whether the pipeline honors the `crop` flag.
    pub fn supports_crop(&self) -> bool {
        matches!(
            self,
            JobKind::RemoveBackground | JobKind::UpscaleRemoveBackground
        )
    }

    pub fn all() -> [JobKind; 3] {
        [
            JobKind::RemoveBackground,
            JobKind::Upscale,
            JobKind::UpscaleRemoveBackground,
        ]
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = FleetError;

    // Route aliases are accepted alongside the canonical names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remove-background" | "remove-bg" => Ok(JobKind::RemoveBackground),
            "upscale" | "upscale-image" => Ok(JobKind::Upscale),
            "upscale-remove-background" | "upscale-remove-bg" => {
                Ok(JobKind::UpscaleRemoveBackground)
            }
            other => Err(FleetError::Validation(format!("unknown job kind: {other}"))),
        }
    }
}

/// Output encoding requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Webp => "WEBP",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }
}

impl Default for ImageFormat {
    fn default() -> Self {
        ImageFormat::Png
    }
}

impl FromStr for ImageFormat {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PNG" => Ok(ImageFormat::Png),
            "JPEG" | "JPG" => Ok(ImageFormat::Jpeg),
            "WEBP" => Ok(ImageFormat::Webp),
            other => Err(FleetError::Validation(format!(
                "unsupported format: {other} (expected PNG, JPEG or WEBP)"
            ))),
        }
    }
}

/// Lifecycle state of a job.
///
/// Legal transitions are `pending -> processing -> completed | failed` plus
/// the eviction path `pending -> failed` (stuck jobs); nothing ever moves
/// backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Processing)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
                | (JobState::Pending, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(FleetError::Validation(format!("unknown state: {other}"))),
        }
    }
}

/// Immutable job input: the uploaded image plus its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    /// Base64 payload, with or without a `data:` URL prefix.
    pub image_b64: String,
    pub format: ImageFormat,
    pub crop: bool,
}

/// Result payload of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Data URL of the result image.
    pub image: String,
    pub content_type: String,
    pub filename: String,
    pub prompt_id: String,
}

/// Failure payload of a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn from_error(err: &FleetError) -> Self {
        Self::new(err.kind(), err.to_string())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A tracked job. Mutated only through the job registry.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub input: JobInput,
    pub created_at: SystemTime,
    /// Per-submission uniqueness token injected into save nodes to defeat
    /// upstream graph-level result caching.
    pub fingerprint: String,

    pub state: JobState,
    pub assigned_worker: Option<String>,
    pub prompt_id: Option<String>,
    pub processing_started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub result: Option<JobOutcome>,
    pub error: Option<JobFailure>,
    pub last_touched_at: SystemTime,
}

impl Job {
    pub fn new(kind: JobKind, input: JobInput) -> Self {
        let id = JobId::new();
        let now = SystemTime::now();
        let millis = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        Self {
            fingerprint: format!("job_{}_{}", id.short(), millis),
            id,
            kind,
            input,
            created_at: now,
            state: JobState::Pending,
            assigned_worker: None,
            prompt_id: None,
            processing_started_at: None,
            finished_at: None,
            result: None,
            error: None,
            last_touched_at: now,
        }
    }

    /// Wall-clock processing time: start of processing to finish, or to now
    /// for a job still in flight.
    pub fn processing_time(&self) -> Option<Duration> {
        let started = self.processing_started_at?;
        let end = self.finished_at.unwrap_or_else(SystemTime::now);
        end.duration_since(started).ok()
    }
}
