use crate::breaker::Admission;
use crate::health::HealthMonitor;
use crate::worker::Worker;
use pixelfleet_metrics::MetricsRegistry;
use std::sync::Arc;
use tracing::debug;

/// Least-loaded selection over the healthy part of the fleet.
pub struct LoadBalancer {
    workers: Vec<Arc<Worker>>,
    max_jobs_per_worker: u32,
    metrics: Arc<MetricsRegistry>,
}

/// A worker chosen for dispatch, together with the breaker admission that was
/// granted for it. Dropping the selection without dispatching must go through
/// [`LoadBalancer::abandon`] so a half-open probe slot is returned.
pub struct Selection {
    pub worker: Arc<Worker>,
    probe: bool,
}

impl LoadBalancer {
    pub fn new(
        workers: Vec<Arc<Worker>>,
        max_jobs_per_worker: u32,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers,
            max_jobs_per_worker,
            metrics,
        })
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Dispatchable workers, least-loaded first, ties broken by stable id.
    fn candidates(&self) -> Vec<Arc<Worker>> {
        let mut candidates: Vec<_> = self
            .workers
            .iter()
            .filter(|w| w.is_dispatchable(self.max_jobs_per_worker))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.active_jobs()
                .cmp(&b.active_jobs())
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Picks the best dispatchable worker, gating each candidate through its
    /// breaker and the monitor's real-time probe. Candidates that fail the
    /// gate are marked unhealthy for this attempt and the next one is tried.
    pub async fn select(&self, health: &HealthMonitor) -> Option<Selection> {
        for worker in self.candidates() {
            let probe = match worker.breaker.try_admit() {
                Admission::Allowed => false,
                Admission::AllowedProbe => true,
                Admission::Rejected { retry_in } => {
                    debug!(
                        worker = %worker.id,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "skipping worker behind open breaker"
                    );
                    continue;
                }
            };

            if health.before_dispatch(&worker).await {
                return Some(Selection { worker, probe });
            }

            // Real-time gate failed: give back the probe slot, count the
            // miss, move on.
            if probe {
                worker.breaker.cancel_probe();
            }
            self.metrics.record_dispatch_failure(&worker.id);
        }
        None
    }

    /// Returns a selection that will not be dispatched after all.
    pub fn abandon(&self, selection: Selection) {
        if selection.probe {
            selection.worker.breaker.cancel_probe();
        }
    }

    pub fn increment(&self, worker: &Worker) {
        worker.increment_active();
    }

    pub fn decrement(&self, worker: &Worker) {
        worker.decrement_active();
    }
}
