use crate::balancer::LoadBalancer;
use crate::breaker::BreakerSnapshot;
use crate::executor::ExecutionEnv;
use crate::health::{HealthConfig, HealthMonitor};
use crate::registry::{JobFilter, JobRegistry, RegistryStats};
use crate::scheduler::Scheduler;
use crate::worker::{Worker, WorkerSnapshot};
use pixelfleet_common::error::{FleetError, Result};
use pixelfleet_common::job::{Job, JobId, JobInput, JobKind};
use pixelfleet_common::FleetConfig;
use pixelfleet_metrics::{persist, MetricsRegistry, MetricsSnapshot};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pause between a completion signal and the history fetch, letting the
/// worker flush outputs to disk.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on waiting for any single background task at shutdown; covers
/// the scheduler's own graceful drain.
const SHUTDOWN_TASK_DEADLINE: Duration = Duration::from_secs(35);

/// The explicitly constructed system context.
///
/// Owns every component of the pipeline - job registry, load balancer, health
/// monitor, per-worker stream pools, metrics, scheduler - and is handed into
/// request handlers instead of any global state. `start` brings the
/// background loops up; `shutdown` tears them down in order and attempts a
/// final metrics snapshot.
pub struct Engine {
    config: FleetConfig,
    registry: Arc<JobRegistry>,
    metrics: Arc<MetricsRegistry>,
    workers: Vec<Arc<Worker>>,
    health: Arc<HealthMonitor>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl Engine {
    /// Wires the components together. Fails on invalid configuration; no
    /// background task runs until [`start`](Engine::start).
    pub fn new(config: FleetConfig) -> Result<Arc<Self>> {
        let config = config.validate()?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| FleetError::Transport(format!("HTTP client init failed: {e}")))?;

        let workers: Vec<Arc<Worker>> = config
            .worker_hosts
            .iter()
            .map(|host| Worker::from_config(host, http.clone(), &config))
            .collect();

        let metrics = Arc::new(MetricsRegistry::new());
        let registry = JobRegistry::new(config.job_timeout(), config.terminal_retention());
        let health = HealthMonitor::new(
            workers.clone(),
            HealthConfig {
                probe_interval: config.probe_interval(),
                dispatch_probe_timeout: config.dispatch_probe_timeout(),
                bg_probe_timeout: config.bg_probe_timeout(),
                failure_threshold: config.breaker.failure_threshold,
                freshness: Duration::from_secs(2),
            },
        );
        let balancer = LoadBalancer::new(
            workers.clone(),
            config.max_jobs_per_worker,
            metrics.clone(),
        );
        let env = Arc::new(ExecutionEnv {
            registry: registry.clone(),
            metrics: metrics.clone(),
            execution_timeout: config.execution_timeout(),
            call_timeout: config.breaker.call_timeout(),
            settle_delay: SETTLE_DELAY,
            output_files: config.output_files,
            output_dir: config.output_dir.clone(),
        });
        let scheduler = Scheduler::new(
            registry.clone(),
            balancer,
            health.clone(),
            env,
            config.max_concurrent_global,
            config.scheduler_tick(),
        );

        Ok(Arc::new(Self {
            config,
            registry,
            metrics,
            workers,
            health,
            scheduler,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        }))
    }

    /// Starts the scheduler, the health monitor, per-worker pool maintenance
    /// and (when configured) metrics persistence.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap();

        handles.push(
            self.scheduler
                .clone()
                .spawn(self.shutdown.child_token()),
        );
        handles.push(self.health.clone().spawn(self.shutdown.child_token()));

        for worker in &self.workers {
            let worker = worker.clone();
            let tick = self.config.stream_health_tick();
            let ping_deadline = self.config.bg_probe_timeout();
            let token = self.shutdown.child_token();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            // Dead idle streams count toward the breaker.
                            let evicted = worker.pool.ping_idle(ping_deadline).await;
                            for _ in 0..evicted {
                                worker.breaker.record_failure();
                            }
                        }
                    }
                }
            }));
        }

        if let Some(path) = &self.config.metrics_file_path {
            handles.push(persist::spawn(
                self.metrics.clone(),
                path.clone(),
                self.config.metrics_save_interval(),
                self.shutdown.child_token(),
            ));
        }

        info!(
            workers = self.workers.len(),
            "engine started with {} worker(s)",
            self.workers.len()
        );
    }

    /// Graceful shutdown: stop accepting dispatches, drain in-flight jobs up
    /// to the scheduler's deadline, close all pools. The persistence task
    /// writes its final snapshot as it exits.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.shutdown.cancel();

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_TASK_DEADLINE, handle)
                .await
                .is_err()
            {
                warn!("background task did not stop within the shutdown deadline");
            }
        }

        for worker in &self.workers {
            worker.pool.close().await;
        }
        info!("engine stopped");
    }

    /// Creates a job. The scheduler picks it up on its next tick.
    pub fn submit(&self, kind: JobKind, input: JobInput) -> Result<JobId> {
        if input.image_b64.trim().is_empty() {
            return Err(FleetError::Validation("empty image payload".to_string()));
        }
        let job = self.registry.create(kind, input);
        self.metrics.record_created(kind.as_str());
        Ok(job.id)
    }

    /// Waits for the job to reach a terminal state, bounded by the job
    /// deadline. A short grace on top of the deadline lets the registry's own
    /// eviction verdict (stuck) win over this wait timing out.
    pub async fn wait_terminal(&self, id: JobId) -> Option<Job> {
        let deadline = self.config.job_timeout() + Duration::from_secs(2);
        self.registry.wait_terminal(id, deadline).await
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.registry.get(id)
    }

    pub fn jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.registry.list(filter)
    }

    pub fn delete_job(&self, id: JobId) -> bool {
        self.registry.delete(id)
    }

    pub fn cleanup_jobs(&self) -> usize {
        self.registry.cleanup_terminal()
    }

    pub fn job_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight_count()
    }

    pub fn healthy_worker_count(&self) -> usize {
        self.workers.iter().filter(|w| w.healthy()).count()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            snapshots.push(worker.snapshot().await);
        }
        snapshots
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.workers.iter().map(|w| w.breaker.snapshot()).collect()
    }

    /// Admin: force one worker's breaker open. Returns false for an unknown
    /// name.
    pub fn force_breaker_open(&self, name: &str) -> bool {
        match self.workers.iter().find(|w| w.breaker.name() == name) {
            Some(worker) => {
                worker.breaker.force_open();
                true
            }
            None => false,
        }
    }

    /// Admin: force one worker's breaker closed. Returns false for an
    /// unknown name.
    pub fn force_breaker_close(&self, name: &str) -> bool {
        match self.workers.iter().find(|w| w.breaker.name() == name) {
            Some(worker) => {
                worker.breaker.force_close();
                true
            }
            None => false,
        }
    }

    /// Kicks off one background health round outside the normal interval.
    pub async fn probe_all_workers(&self) {
        self.health.check_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelfleet_common::job::{ImageFormat, JobState};

    fn config() -> FleetConfig {
        FleetConfig {
            worker_hosts: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        }
    }

    fn input() -> JobInput {
        JobInput {
            image_b64: "aGVsbG8=".to_string(),
            format: ImageFormat::Png,
            crop: false,
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = FleetConfig::default(); // no workers
        assert!(Engine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_submit_creates_pending_job() {
        let engine = Engine::new(config()).unwrap();
        let id = engine.submit(JobKind::Upscale, input()).unwrap();

        let job = engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(engine.metrics_snapshot().jobs_created, 1);
        assert_eq!(engine.job_stats().by_state["pending"], 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_payload() {
        let engine = Engine::new(config()).unwrap();
        let err = engine
            .submit(
                JobKind::Upscale,
                JobInput {
                    image_b64: "  ".to_string(),
                    format: ImageFormat::Png,
                    crop: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[tokio::test]
    async fn test_breaker_admin_by_name() {
        let engine = Engine::new(config()).unwrap();
        assert!(engine.force_breaker_open("127.0.0.1:1"));
        assert_eq!(
            engine.breaker_snapshots()[0].state,
            crate::breaker::BreakerState::Open
        );
        assert!(engine.force_breaker_close("127.0.0.1:1"));
        assert!(!engine.force_breaker_open("nope"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = Engine::new(config()).unwrap();
        engine.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.scheduler_running());

        engine.shutdown().await;
        assert!(!engine.scheduler_running());
    }

    #[tokio::test]
    async fn test_healthy_worker_count() {
        let engine = Engine::new(config()).unwrap();
        // Workers start optimistically healthy.
        assert_eq!(engine.healthy_worker_count(), 1);
        engine.probe_all_workers().await;
        // One failed probe round is below the flip threshold.
        assert_eq!(engine.healthy_worker_count(), 1);
        engine.probe_all_workers().await;
        engine.probe_all_workers().await;
        assert_eq!(engine.healthy_worker_count(), 0);
    }
}
