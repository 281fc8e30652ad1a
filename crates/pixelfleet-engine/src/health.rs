use crate::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Health monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Background probe interval.
    pub probe_interval: Duration,
    /// Deadline for dispatch-time probes.
    pub dispatch_probe_timeout: Duration,
    /// Deadline for background probes.
    pub bg_probe_timeout: Duration,
    /// Consecutive background-probe failures before a worker flips
    /// unhealthy.
    pub failure_threshold: u32,
    /// How recent a cached healthy verdict must be to skip a new probe.
    pub freshness: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            dispatch_probe_timeout: Duration::from_secs(2),
            bg_probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            freshness: Duration::from_secs(2),
        }
    }
}

/// Decides at any instant whether a worker may receive new work.
///
/// Cached verdicts answer most queries; `before_dispatch` re-probes with a
/// short deadline whenever the cache is stale. A background loop probes every
/// worker concurrently so one slow worker never delays another's verdict.
pub struct HealthMonitor {
    workers: Vec<Arc<Worker>>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(workers: Vec<Arc<Worker>>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self { workers, config })
    }

    /// Cached verdict; never performs I/O.
    pub fn is_healthy(&self, worker: &Worker) -> bool {
        worker.healthy()
    }

    /// Real-time gate used by the scheduler just before dispatch.
    ///
    /// Fresh cached healthy state passes immediately; otherwise a probe with
    /// the short dispatch deadline decides, and a failure marks the worker
    /// unhealthy for this attempt.
    pub async fn before_dispatch(&self, worker: &Worker) -> bool {
        if worker.healthy_and_fresh(self.config.freshness) {
            return true;
        }
        match worker
            .client
            .probe(self.config.dispatch_probe_timeout)
            .await
        {
            Ok(()) => {
                worker.mark_healthy();
                true
            }
            Err(e) => {
                worker.mark_unhealthy(&e.to_string());
                false
            }
        }
    }

    /// One background probe of one worker.
    async fn probe_background(&self, worker: &Worker) {
        match worker.client.probe(self.config.bg_probe_timeout).await {
            Ok(()) => {
                if !worker.healthy() {
                    info!(worker = %worker.id, "worker recovered");
                }
                worker.mark_healthy();
            }
            Err(e) => {
                debug!(worker = %worker.id, "background probe failed: {e}");
                worker.record_probe_failure(self.config.failure_threshold, &e.to_string());
            }
        }
    }

    /// Probes all registered workers concurrently.
    pub async fn check_all(&self) {
        let probes = self
            .workers
            .iter()
            .map(|worker| self.probe_background(worker));
        futures::future::join_all(probes).await;
    }

    /// Starts the background probe loop.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.probe_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => self.check_all().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use pixelfleet_common::config::FleetConfig;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn live_worker() -> Arc<Worker> {
        let app =
            Router::new().route("/system_stats", get(|| async { Json(json!({"ok": true})) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = FleetConfig {
            worker_hosts: vec![addr.clone()],
            ..Default::default()
        };
        Worker::from_config(&addr, reqwest::Client::new(), &config)
    }

    fn dead_worker() -> Arc<Worker> {
        let config = FleetConfig {
            worker_hosts: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        };
        Worker::from_config("127.0.0.1:1", reqwest::Client::new(), &config)
    }

    #[tokio::test]
    async fn test_before_dispatch_probes_stale_worker() {
        let worker = live_worker().await;
        let monitor = HealthMonitor::new(vec![worker.clone()], HealthConfig::default());

        // Cache is stale (no probe yet), so this performs a real probe.
        assert!(monitor.before_dispatch(&worker).await);
        assert!(worker.healthy_and_fresh(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_before_dispatch_fails_and_marks_unhealthy() {
        let worker = dead_worker();
        let monitor = HealthMonitor::new(vec![worker.clone()], HealthConfig::default());

        assert!(!monitor.before_dispatch(&worker).await);
        assert!(!worker.healthy());
    }

    #[tokio::test]
    async fn test_before_dispatch_uses_fresh_cache() {
        // The worker address is dead, but a fresh healthy verdict means no
        // probe happens and dispatch is allowed.
        let worker = dead_worker();
        worker.mark_healthy();
        let monitor = HealthMonitor::new(vec![worker.clone()], HealthConfig::default());
        assert!(monitor.before_dispatch(&worker).await);
    }

    #[tokio::test]
    async fn test_check_all_flips_after_threshold() {
        let worker = dead_worker();
        let monitor = HealthMonitor::new(
            vec![worker.clone()],
            HealthConfig {
                bg_probe_timeout: Duration::from_millis(300),
                failure_threshold: 2,
                ..Default::default()
            },
        );

        monitor.check_all().await;
        assert!(worker.healthy(), "one failure is below the threshold");
        monitor.check_all().await;
        assert!(!worker.healthy());
    }

    #[tokio::test]
    async fn test_check_all_recovers_worker() {
        let worker = live_worker().await;
        worker.mark_unhealthy("simulated");
        let monitor = HealthMonitor::new(vec![worker.clone()], HealthConfig::default());

        monitor.check_all().await;
        assert!(worker.healthy());
    }

    #[tokio::test]
    async fn test_slow_worker_does_not_block_others() {
        // One dead worker with a short timeout alongside a live one: the live
        // worker's probe result must not depend on the dead one's deadline.
        let live = live_worker().await;
        let dead = dead_worker();
        let monitor = HealthMonitor::new(
            vec![dead.clone(), live.clone()],
            HealthConfig {
                bg_probe_timeout: Duration::from_millis(500),
                failure_threshold: 1,
                ..Default::default()
            },
        );

        monitor.check_all().await;
        assert!(live.healthy());
        assert!(!dead.healthy());
    }
}
