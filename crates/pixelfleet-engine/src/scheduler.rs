use crate::balancer::LoadBalancer;
use crate::executor::{self, ExecutionEnv};
use crate::health::HealthMonitor;
use crate::registry::{JobPatch, JobRegistry};
use crate::worker::Worker;
use pixelfleet_common::job::{JobId, JobState};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded wait for in-flight jobs at shutdown before force-cancelling.
const GRACEFUL_DRAIN: Duration = Duration::from_secs(30);

/// Drives `pending` jobs through execution under the global and per-worker
/// concurrency caps.
///
/// A single cooperative loop scans pending jobs every tick; each dispatched
/// job runs as its own task whose guard releases the worker slot and the
/// in-flight entry no matter how the task ends. A tick with no dispatchable
/// worker leaves jobs pending: starvation is not failure, only the per-job
/// deadline evicts.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthMonitor>,
    env: Arc<ExecutionEnv>,
    max_concurrent_global: usize,
    tick: Duration,
    in_flight: Mutex<HashSet<JobId>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        balancer: Arc<LoadBalancer>,
        health: Arc<HealthMonitor>,
        env: Arc<ExecutionEnv>,
        max_concurrent_global: usize,
        tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            balancer,
            health,
            env,
            max_concurrent_global,
            tick,
            in_flight: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Whether the dispatch loop is currently alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Starts the dispatch loop.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        self.running.store(true, Ordering::Release);
        info!(
            max_concurrent = self.max_concurrent_global,
            tick_ms = self.tick.as_millis() as u64,
            "scheduler started"
        );

        let mut tasks = JoinSet::new();
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            // Reap finished job tasks so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}
            Self::dispatch_round(&self, &mut tasks).await;
        }

        self.running.store(false, Ordering::Release);
        if !tasks.is_empty() {
            info!("scheduler stopping, draining {} in-flight jobs", tasks.len());
        }
        let drained = tokio::time::timeout(GRACEFUL_DRAIN, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("graceful drain deadline exceeded, force-cancelling in-flight jobs");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    /// One tick: fill free slots with pending jobs in creation order.
    async fn dispatch_round(this: &Arc<Self>, tasks: &mut JoinSet<()>) {
        let mut free = this
            .max_concurrent_global
            .saturating_sub(this.in_flight_count());
        if free == 0 {
            return;
        }

        let pending = this.registry.list_by_state(JobState::Pending);
        for job in pending {
            if free == 0 {
                break;
            }

            let Some(selection) = this.balancer.select(&this.health).await else {
                // No dispatchable worker right now; the jobs stay pending
                // and are retried next tick.
                debug!("no dispatchable worker this tick");
                break;
            };
            let worker = Arc::clone(&selection.worker);

            let dispatched = this.registry.transition(
                job.id,
                JobState::Processing,
                JobPatch {
                    assigned_worker: Some(worker.id.clone()),
                    ..Default::default()
                },
            );
            let job = match dispatched {
                Ok(job) => job,
                Err(e) => {
                    // The job was evicted or mutated between the scan and
                    // now; give back the admission and move on.
                    debug!(job = %job.id, "dispatch skipped: {e}");
                    this.balancer.abandon(selection);
                    continue;
                }
            };

            this.balancer.increment(&worker);
            this.in_flight.lock().unwrap().insert(job.id);
            this.env.metrics.record_dispatched(&worker.id);
            debug!(job = %job.id, worker = %worker.id, "job dispatched");

            let scheduler = Arc::clone(this);
            let env = Arc::clone(&this.env);
            tasks.spawn(async move {
                let _guard = DispatchGuard {
                    scheduler,
                    worker: Arc::clone(&worker),
                    id: job.id,
                };
                executor::run_job(env, worker, job).await;
            });
            free -= 1;
        }
    }
}

/// Releases the worker slot and the in-flight entry when a job task ends,
/// including cancellation.
struct DispatchGuard {
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    id: JobId,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.scheduler.balancer.decrement(&self.worker);
        self.scheduler.in_flight.lock().unwrap().remove(&self.id);
    }
}
