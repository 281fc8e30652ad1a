//! # Pixelfleet CLI Entry Point
//!
//! Main binary for the pixelfleet middleware. Starts the HTTP server and the
//! job pipeline against a configured fleet of upstream image-processing
//! workers.
//!
//! ## Usage
//!
//! ```bash
//! # Serve on port 3000 against two workers
//! pixelfleet serve -w 10.0.0.1:8188 -w 10.0.0.2:8188
//!
//! # Tighter concurrency, metrics persistence, debug logging
//! pixelfleet serve -w 10.0.0.1:8188 \
//!   --max-concurrent 2 --max-jobs-per-worker 1 \
//!   --metrics-file /var/lib/pixelfleet/metrics.json \
//!   --log-level debug
//! ```
//!
//! The process exits non-zero when startup fails (invalid configuration,
//! bind failure) and otherwise runs until interrupted; ctrl-c triggers a
//! graceful shutdown that drains in-flight jobs and writes a final metrics
//! snapshot.

use anyhow::{Context, Result};
use argh::FromArgs;
use pixelfleet_common::FleetConfig;
use pixelfleet_engine::Engine;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// pixelfleet - concurrency middleware for image-processing worker fleets
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
}

/// Arguments for running the middleware server.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the middleware server
struct ServeArgs {
    /// listen port for the HTTP surface
    #[argh(option, short = 'p', default = "3000")]
    port: u16,

    /// upstream worker address as host:port (repeatable)
    #[argh(option, short = 'w', long = "worker")]
    workers: Vec<String>,

    /// talk to workers over https/wss instead of http/ws
    #[argh(switch)]
    use_tls: bool,

    /// global cap on concurrently executing jobs
    #[argh(option, long = "max-concurrent", default = "4")]
    max_concurrent: usize,

    /// cap on concurrently executing jobs per worker
    #[argh(option, long = "max-jobs-per-worker", default = "2")]
    max_jobs_per_worker: u32,

    /// streaming channels kept per worker, clamped to [1, 10]
    #[argh(option, long = "max-streams-per-worker", default = "3")]
    max_streams_per_worker: usize,

    /// seconds before an unfinished job is failed as stuck and evicted
    #[argh(option, long = "job-timeout", default = "300")]
    job_timeout_secs: u64,

    /// milliseconds a terminal job stays readable before eviction
    #[argh(option, long = "terminal-retention-ms", default = "30000")]
    terminal_retention_ms: u64,

    /// scheduler tick in milliseconds
    #[argh(option, long = "tick-interval-ms", default = "1000")]
    tick_interval_ms: u64,

    /// background health probe interval in seconds
    #[argh(option, long = "probe-interval", default = "30")]
    probe_interval_secs: u64,

    /// per-job execution deadline in seconds, measured from stream
    /// acquisition
    #[argh(option, long = "execution-timeout", default = "60")]
    execution_timeout_secs: u64,

    /// consecutive failures before a worker's breaker opens
    #[argh(option, long = "breaker-failure-threshold", default = "3")]
    breaker_failure_threshold: u32,

    /// base breaker reset timeout in seconds (grows 1.5x per reopen)
    #[argh(option, long = "breaker-reset-timeout", default = "15")]
    breaker_reset_timeout_secs: u64,

    /// also write result images under the outputs directory
    #[argh(switch, long = "output-files")]
    output_files: bool,

    /// directory for the optional file sink
    #[argh(option, long = "output-dir", default = "\"outputs\".into()")]
    output_dir: String,

    /// metrics snapshot file; omit to disable persistence
    #[argh(option, long = "metrics-file")]
    metrics_file: Option<String>,

    /// metrics snapshot interval in seconds
    #[argh(option, long = "metrics-save-interval", default = "300")]
    metrics_save_interval_secs: u64,

    /// default log level when RUST_LOG is not set
    #[argh(option, long = "log-level", default = "\"info\".into()")]
    log_level: String,
}

impl ServeArgs {
    fn into_config(self) -> FleetConfig {
        FleetConfig {
            port: self.port,
            worker_hosts: self.workers,
            use_tls: self.use_tls,
            max_streams_per_worker: self.max_streams_per_worker,
            max_concurrent_global: self.max_concurrent,
            max_jobs_per_worker: self.max_jobs_per_worker,
            job_timeout_secs: self.job_timeout_secs,
            terminal_retention_ms: self.terminal_retention_ms,
            scheduler_tick_interval_ms: self.tick_interval_ms,
            probe_interval_secs: self.probe_interval_secs,
            execution_timeout_secs: self.execution_timeout_secs,
            output_files: self.output_files,
            output_dir: PathBuf::from(self.output_dir),
            metrics_file_path: self.metrics_file.map(PathBuf::from),
            metrics_save_interval_secs: self.metrics_save_interval_secs,
            log_level: self.log_level,
            breaker: pixelfleet_common::config::BreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                reset_timeout_secs: self.breaker_reset_timeout_secs,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();
    let Commands::Serve(args) = cli.command;
    let config = args.into_config();

    // Default log level comes from the config; RUST_LOG overrides.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(
        workers = config.worker_hosts.len(),
        port = config.port,
        "starting pixelfleet"
    );

    let engine = Engine::new(config.clone()).context("engine startup failed")?;
    engine.start();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    pixelfleet_server::serve(engine.clone(), addr, shutdown)
        .await
        .context("server failed")?;

    engine.shutdown().await;
    Ok(())
}
