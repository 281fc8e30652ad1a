use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Circuit breaker tuning, one instance shared by every breaker in the fleet.
///
/// A breaker opens after `failure_threshold` consecutive failures, or when the
/// error rate over the rolling `window_secs` window exceeds
/// `error_threshold_pct` with at least `volume_threshold` samples. While open,
/// calls are rejected until `reset_timeout_secs` elapses; each reopen grows
/// the timeout by 1.5x up to `max_reset_timeout_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping. Default: 3
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing. Default: 2
    pub success_threshold: u32,
    /// Base open-state timeout in seconds. Default: 15
    pub reset_timeout_secs: u64,
    /// Cap for the growing open-state timeout in seconds. Default: 120
    pub max_reset_timeout_secs: u64,
    /// Minimum samples in the rolling window before the error-rate rule
    /// applies. Default: 10
    pub volume_threshold: usize,
    /// Error percentage over the rolling window that trips the breaker.
    /// Default: 50.0
    pub error_threshold_pct: f64,
    /// Rolling window length in seconds. Default: 60
    pub window_secs: u64,
    /// Per-call deadline in seconds; exceeding it counts as a failure.
    /// Default: 30
    pub call_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout_secs: 15,
            max_reset_timeout_secs: 120,
            volume_threshold: 10,
            error_threshold_pct: 50.0,
            window_secs: 60,
            call_timeout_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn max_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.max_reset_timeout_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Complete configuration for a pixelfleet instance.
///
/// Defaults follow the operational values the system was tuned with; every
/// field can be overridden from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Listen port for the northbound HTTP surface. Default: 3000
    pub port: u16,
    /// Seed worker addresses, `host:port`. Stable worker ids are derived from
    /// these strings.
    pub worker_hosts: Vec<String>,
    /// Upstream scheme: `https`/`wss` when true, `http`/`ws` otherwise.
    pub use_tls: bool,

    /// Streams kept per worker, clamped to [1, 10]. Default: 3
    pub max_streams_per_worker: usize,
    /// Global in-flight job cap. Default: 4
    pub max_concurrent_global: usize,
    /// Per-worker in-flight job cap. Default: 2
    pub max_jobs_per_worker: u32,

    /// Deadline after which a job that never reached a terminal state is
    /// failed as stuck and evicted, in seconds. Default: 300
    pub job_timeout_secs: u64,
    /// Grace window keeping a terminal job readable before eviction, in
    /// milliseconds. Default: 30000
    pub terminal_retention_ms: u64,
    /// Scheduler tick, in milliseconds. Default: 1000
    pub scheduler_tick_interval_ms: u64,

    /// Background health probe interval, in seconds. Default: 30
    pub probe_interval_secs: u64,
    /// Deadline for dispatch-time probes, in milliseconds. Default: 2000
    pub dispatch_probe_timeout_ms: u64,
    /// Deadline for background probes, in milliseconds. Default: 5000
    pub bg_probe_timeout_ms: u64,

    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,

    /// Per-job execution deadline measured from stream acquisition, in
    /// seconds. Default: 60
    pub execution_timeout_secs: u64,

    /// Stream open deadline, in milliseconds. Default: 10000
    pub stream_connect_timeout_ms: u64,
    /// Pool acquire deadline, in milliseconds. Default: 30000
    pub stream_acquire_timeout_ms: u64,
    /// Reconnect attempts after an unexpected stream close. Default: 5
    pub max_reconnect_attempts: u32,
    /// Idle-stream liveness tick, in seconds. Default: 30
    pub stream_health_tick_secs: u64,

    /// When true, completed images are also written under `output_dir`.
    pub output_files: bool,
    /// Directory for the optional file sink. Default: `outputs`
    pub output_dir: PathBuf,

    /// Metrics snapshot file; `None` disables persistence.
    pub metrics_file_path: Option<PathBuf>,
    /// Metrics snapshot interval, in seconds. Default: 300
    pub metrics_save_interval_secs: u64,

    /// Default log level when `RUST_LOG` is not set. Default: `info`
    pub log_level: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            worker_hosts: Vec::new(),
            use_tls: false,
            max_streams_per_worker: 3,
            max_concurrent_global: 4,
            max_jobs_per_worker: 2,
            job_timeout_secs: 300,
            terminal_retention_ms: 30_000,
            scheduler_tick_interval_ms: 1_000,
            probe_interval_secs: 30,
            dispatch_probe_timeout_ms: 2_000,
            bg_probe_timeout_ms: 5_000,
            breaker: BreakerConfig::default(),
            execution_timeout_secs: 60,
            stream_connect_timeout_ms: 10_000,
            stream_acquire_timeout_ms: 30_000,
            max_reconnect_attempts: 5,
            stream_health_tick_secs: 30,
            output_files: false,
            output_dir: PathBuf::from("outputs"),
            metrics_file_path: None,
            metrics_save_interval_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl FleetConfig {
    /// Validates and normalizes the configuration.
    ///
    /// `max_streams_per_worker` is clamped into [1, 10]; structurally invalid
    /// settings (no workers, zero caps) are rejected.
    pub fn validate(mut self) -> Result<Self> {
        if self.worker_hosts.is_empty() {
            return Err(FleetError::InvalidConfig(
                "at least one worker host is required".to_string(),
            ));
        }
        if self.max_concurrent_global == 0 {
            return Err(FleetError::InvalidConfig(
                "max_concurrent_global must be at least 1".to_string(),
            ));
        }
        if self.max_jobs_per_worker == 0 {
            return Err(FleetError::InvalidConfig(
                "max_jobs_per_worker must be at least 1".to_string(),
            ));
        }
        self.max_streams_per_worker = self.max_streams_per_worker.clamp(1, 10);
        Ok(self)
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.use_tls {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_millis(self.terminal_retention_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn dispatch_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_probe_timeout_ms)
    }

    pub fn bg_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.bg_probe_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn stream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_connect_timeout_ms)
    }

    pub fn stream_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_acquire_timeout_ms)
    }

    pub fn stream_health_tick(&self) -> Duration {
        Duration::from_secs(self.stream_health_tick_secs)
    }

    pub fn metrics_save_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_save_interval_secs)
    }
}
