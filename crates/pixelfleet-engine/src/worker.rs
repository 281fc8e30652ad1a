use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use pixelfleet_common::config::FleetConfig;
use pixelfleet_worker::{PoolStats, StreamPool, StreamPoolConfig, WorkerClient};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// One upstream worker as seen by the engine: identity, mutable health state,
/// the in-flight job counter, the HTTP client, the stream pool, and the
/// circuit breaker guarding it.
pub struct Worker {
    /// Stable id; the seed `host:port` string.
    pub id: String,
    pub client: WorkerClient,
    pub pool: StreamPool,
    pub breaker: CircuitBreaker,

    healthy: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    consecutive_probe_failures: AtomicU32,
    active_jobs: AtomicU32,
}

/// Serializable worker row for `/health` and `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub healthy: bool,
    pub active_jobs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_ms_ago: Option<u64>,
    pub breaker: BreakerSnapshot,
    pub pool: PoolStats,
}

impl Worker {
    /// Builds a worker from one seed host using the shared HTTP client.
    pub fn from_config(host: &str, http: reqwest::Client, config: &FleetConfig) -> Arc<Self> {
        let ws_base = format!("{}://{}", config.ws_scheme(), host);
        let pool = StreamPool::new(
            host,
            &ws_base,
            StreamPoolConfig {
                max_streams: config.max_streams_per_worker,
                connect_timeout: config.stream_connect_timeout(),
                acquire_timeout: config.stream_acquire_timeout(),
                max_reconnect_attempts: config.max_reconnect_attempts,
            },
        );
        Arc::new(Self {
            id: host.to_string(),
            client: WorkerClient::new(http, host, config.scheme(), host),
            pool,
            breaker: CircuitBreaker::new(host, config.breaker.clone()),
            // Workers start healthy; the first probe round corrects this
            // within one interval.
            healthy: AtomicBool::new(true),
            last_probe: Mutex::new(None),
            consecutive_probe_failures: AtomicU32::new(0),
            active_jobs: AtomicU32::new(0),
        })
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// True when the cached state is healthy and was refreshed within
    /// `freshness`.
    pub fn healthy_and_fresh(&self, freshness: Duration) -> bool {
        if !self.healthy() {
            return false;
        }
        self.last_probe
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < freshness)
            .unwrap_or(false)
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
        self.consecutive_probe_failures.store(0, Ordering::Relaxed);
        *self.last_probe.lock().unwrap() = Some(Instant::now());
    }

    pub fn mark_unhealthy(&self, reason: &str) {
        let was_healthy = self.healthy.swap(false, Ordering::AcqRel);
        *self.last_probe.lock().unwrap() = Some(Instant::now());
        if was_healthy {
            warn!(worker = %self.id, "worker marked unhealthy: {reason}");
        }
    }

    /// Records a failed background probe; flips to unhealthy once the
    /// consecutive-failure threshold is reached.
    pub fn record_probe_failure(&self, threshold: u32, reason: &str) {
        let failures = self
            .consecutive_probe_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        *self.last_probe.lock().unwrap() = Some(Instant::now());
        if failures >= threshold {
            self.mark_unhealthy(reason);
        }
    }

    pub fn active_jobs(&self) -> u32 {
        self.active_jobs.load(Ordering::Acquire)
    }

    pub fn increment_active(&self) {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_active(&self) {
        // Never underflow, even if a release races a double-call bug.
        let _ = self
            .active_jobs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Dispatchability filter: healthy, below the per-worker cap, and not
    /// behind an open breaker.
    pub fn is_dispatchable(&self, max_jobs_per_worker: u32) -> bool {
        self.healthy()
            && self.active_jobs() < max_jobs_per_worker
            && self.breaker.would_admit()
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let last_probe_ms_ago = self
            .last_probe
            .lock()
            .unwrap()
            .map(|at| at.elapsed().as_millis() as u64);
        WorkerSnapshot {
            id: self.id.clone(),
            healthy: self.healthy(),
            active_jobs: self.active_jobs(),
            last_probe_ms_ago,
            breaker: self.breaker.snapshot(),
            pool: self.pool.stats().await,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_worker(id: &str) -> Arc<Worker> {
    let config = FleetConfig {
        worker_hosts: vec![id.to_string()],
        ..Default::default()
    };
    Worker::from_config(id, reqwest::Client::new(), &config)
}
