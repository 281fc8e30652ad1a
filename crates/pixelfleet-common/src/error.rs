use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified error kind, as surfaced to clients through the job status
/// endpoints.
///
/// The kind drives policy: whether the owning worker is marked unhealthy,
/// whether the failure counts toward the worker's circuit breaker, and which
/// HTTP status class the northbound surface maps it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Bad client input, or the upstream rejected the graph at submit time.
    Validation,
    /// Connection refused / reset / DNS failure / transport-level timeout.
    Transport,
    /// The upstream reported an execution error for our submission.
    UpstreamExecution,
    /// No completion signal arrived within the execution deadline.
    Timeout,
    /// The worker's circuit breaker rejected the call outright.
    BreakerOpen,
    /// Completion was observed but the history entry yielded no image.
    MissingOutput,
    /// The result image could not be downloaded.
    DownloadFailure,
    /// The job sat in the registry past its deadline without completing.
    Stuck,
    /// Anything that does not fit the taxonomy above.
    Internal,
}

impl ErrorKind {
    /// Stable string form used in metrics labels and error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transport => "transport",
            ErrorKind::UpstreamExecution => "upstream-execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BreakerOpen => "breaker-open",
            ErrorKind::MissingOutput => "missing-output",
            ErrorKind::DownloadFailure => "download-failure",
            ErrorKind::Stuck => "stuck",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors produced anywhere in the pixelfleet pipeline.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream execution error: {0}")]
    UpstreamExecution(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("circuit breaker open: {0}")]
    BreakerOpen(String),

    #[error("missing output: {0}")]
    MissingOutput(String),

    #[error("download failure: {0}")]
    DownloadFailure(String),

    #[error("stream pool acquire timed out after {0}ms")]
    PoolTimeout(u64),

    #[error("stream pool closed")]
    PoolClosed,

    #[error("no dispatchable worker available")]
    NoWorkerAvailable,

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("illegal job transition: {0}")]
    IllegalTransition(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Maps the error onto the client-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Validation(_) => ErrorKind::Validation,
            // Pool acquire timeouts surface as transport failures: the caller
            // could not reach the worker within its deadline.
            FleetError::Transport(_) | FleetError::PoolTimeout(_) | FleetError::PoolClosed => {
                ErrorKind::Transport
            }
            FleetError::UpstreamExecution(_) => ErrorKind::UpstreamExecution,
            FleetError::Timeout(_) => ErrorKind::Timeout,
            FleetError::BreakerOpen(_) => ErrorKind::BreakerOpen,
            FleetError::MissingOutput(_) => ErrorKind::MissingOutput,
            FleetError::DownloadFailure(_) => ErrorKind::DownloadFailure,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this failure should flip the owning worker to unhealthy and
    /// count toward its circuit breaker.
    ///
    /// Validation and upstream-execution failures are the graph's fault, not
    /// the worker's; a single missing output or failed download likewise does
    /// not condemn the worker.
    pub fn marks_worker_unhealthy(&self) -> bool {
        matches!(
            self,
            FleetError::Transport(_)
                | FleetError::Timeout(_)
                | FleetError::PoolTimeout(_)
                | FleetError::PoolClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
