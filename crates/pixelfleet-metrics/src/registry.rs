// Copyright 2025 Pixelfleet Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::snapshot::{
    ErrorRecord, KindMetrics, MetricsSnapshot, TimingSnapshot, WorkerMetrics,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Bounded recent-sample buffer for percentile estimation.
const SAMPLE_BUFFER_SIZE: usize = 100;

/// Bounded recent-errors list.
const ERROR_BUFFER_SIZE: usize = 100;

/// Ring of recent processing-time samples plus running aggregates.
///
/// The running min/max/sum/count cover every sample ever recorded; the ring
/// keeps only the most recent `SAMPLE_BUFFER_SIZE` for percentile estimates.
#[derive(Debug, Default)]
struct TimingStats {
    count: u64,
    min_secs: f64,
    max_secs: f64,
    sum_secs: f64,
    ring: Vec<f64>,
    next: usize,
}

impl TimingStats {
    fn record(&mut self, secs: f64) {
        if self.count == 0 || secs < self.min_secs {
            self.min_secs = secs;
        }
        if secs > self.max_secs {
            self.max_secs = secs;
        }
        self.count += 1;
        self.sum_secs += secs;

        if self.ring.len() < SAMPLE_BUFFER_SIZE {
            self.ring.push(secs);
        } else {
            self.ring[self.next] = secs;
            self.next = (self.next + 1) % SAMPLE_BUFFER_SIZE;
        }
    }

    fn snapshot(&self) -> TimingSnapshot {
        if self.count == 0 {
            return TimingSnapshot::default();
        }
        let mut samples = self.ring.clone();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pick = |pct: usize| -> f64 {
            let idx = (samples.len() * pct / 100).min(samples.len() - 1);
            samples[idx]
        };
        TimingSnapshot {
            count: self.count,
            min_secs: self.min_secs,
            max_secs: self.max_secs,
            avg_secs: self.sum_secs / self.count as f64,
            p50_secs: pick(50),
            p90_secs: pick(90),
            p95_secs: pick(95),
            p99_secs: pick(99),
        }
    }
}

#[derive(Debug, Default)]
struct WorkerCounters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dispatch_failures: AtomicU64,
}

#[derive(Debug, Default)]
struct KindCounters {
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Thread-safe metrics registry for the job pipeline.
#[derive(Debug)]
pub struct MetricsRegistry {
    jobs_created: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    workers: RwLock<HashMap<String, Arc<WorkerCounters>>>,
    kinds: RwLock<HashMap<String, Arc<KindCounters>>>,
    timing: Mutex<TimingStats>,
    recent_errors: Mutex<VecDeque<ErrorRecord>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            jobs_created: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            workers: RwLock::new(HashMap::new()),
            kinds: RwLock::new(HashMap::new()),
            timing: Mutex::new(TimingStats::default()),
            recent_errors: Mutex::new(VecDeque::new()),
            start_time: Instant::now(),
        }
    }

    fn worker(&self, worker: &str) -> Arc<WorkerCounters> {
        if let Some(counters) = self.workers.read().unwrap().get(worker) {
            return counters.clone();
        }
        self.workers
            .write()
            .unwrap()
            .entry(worker.to_string())
            .or_default()
            .clone()
    }

    fn kind(&self, kind: &str) -> Arc<KindCounters> {
        if let Some(counters) = self.kinds.read().unwrap().get(kind) {
            return counters.clone();
        }
        self.kinds
            .write()
            .unwrap()
            .entry(kind.to_string())
            .or_default()
            .clone()
    }

    pub fn record_created(&self, kind: &str) {
        self.jobs_created.fetch_add(1, Ordering::Relaxed);
        self.kind(kind).created.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a job handed to a worker.
    pub fn record_dispatched(&self, worker: &str) {
        self.worker(worker).dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatch-time gate failure (real-time probe failed and the
    /// worker was skipped).
    pub fn record_dispatch_failure(&self, worker: &str) {
        self.worker(worker)
            .dispatch_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, kind: &str, worker: &str, processing_time: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.kind(kind).completed.fetch_add(1, Ordering::Relaxed);
        self.worker(worker).completed.fetch_add(1, Ordering::Relaxed);
        self.timing
            .lock()
            .unwrap()
            .record(processing_time.as_secs_f64());
    }

    pub fn record_failed(
        &self,
        kind: &str,
        worker: Option<&str>,
        error_kind: &str,
        message: &str,
    ) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.kind(kind).failed.fetch_add(1, Ordering::Relaxed);
        if let Some(worker) = worker {
            self.worker(worker).failed.fetch_add(1, Ordering::Relaxed);
        }

        let record = ErrorRecord {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
            kind: error_kind.to_string(),
            worker: worker.map(str::to_string),
            message: message.to_string(),
        };
        let mut errors = self.recent_errors.lock().unwrap();
        if errors.len() == ERROR_BUFFER_SIZE {
            errors.pop_front();
        }
        errors.push_back(record);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let workers = self
            .workers
            .read()
            .unwrap()
            .iter()
            .map(|(id, counters)| {
                (
                    id.clone(),
                    WorkerMetrics {
                        dispatched: counters.dispatched.load(Ordering::Relaxed),
                        completed: counters.completed.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                        dispatch_failures: counters.dispatch_failures.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        let kinds = self
            .kinds
            .read()
            .unwrap()
            .iter()
            .map(|(kind, counters)| {
                (
                    kind.clone(),
                    KindMetrics {
                        created: counters.created.load(Ordering::Relaxed),
                        completed: counters.completed.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            processing_time: self.timing.lock().unwrap().snapshot(),
            workers,
            kinds,
            recent_errors: self.recent_errors.lock().unwrap().iter().cloned().collect(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_created_counters() {
        let registry = MetricsRegistry::new();
        registry.record_created("remove-background");
        registry.record_created("remove-background");
        registry.record_created("upscale");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.jobs_created, 3);
        assert_eq!(snapshot.kinds["remove-background"].created, 2);
        assert_eq!(snapshot.kinds["upscale"].created, 1);
    }

    #[test]
    fn test_completed_updates_worker_kind_and_timing() {
        let registry = MetricsRegistry::new();
        registry.record_dispatched("w1");
        registry.record_completed("upscale", "w1", Duration::from_secs(2));
        registry.record_completed("upscale", "w1", Duration::from_secs(4));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.jobs_completed, 2);
        assert_eq!(snapshot.workers["w1"].completed, 2);
        assert_eq!(snapshot.workers["w1"].dispatched, 1);
        assert_eq!(snapshot.kinds["upscale"].completed, 2);
        assert_eq!(snapshot.processing_time.count, 2);
        assert_eq!(snapshot.processing_time.min_secs, 2.0);
        assert_eq!(snapshot.processing_time.max_secs, 4.0);
        assert_eq!(snapshot.processing_time.avg_secs, 3.0);
    }

    #[test]
    fn test_failed_records_recent_error() {
        let registry = MetricsRegistry::new();
        registry.record_failed("upscale", Some("w2"), "transport", "connection refused");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.workers["w2"].failed, 1);
        assert_eq!(snapshot.recent_errors.len(), 1);
        assert_eq!(snapshot.recent_errors[0].kind, "transport");
        assert_eq!(snapshot.recent_errors[0].worker.as_deref(), Some("w2"));
    }

    #[test]
    fn test_failed_without_worker() {
        let registry = MetricsRegistry::new();
        registry.record_failed("upscale", None, "validation", "empty image");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.jobs_failed, 1);
        assert!(snapshot.workers.is_empty());
        assert!(snapshot.recent_errors[0].worker.is_none());
    }

    #[test]
    fn test_recent_errors_are_bounded() {
        let registry = MetricsRegistry::new();
        for i in 0..150 {
            registry.record_failed("upscale", Some("w1"), "timeout", &format!("e{i}"));
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.recent_errors.len(), ERROR_BUFFER_SIZE);
        // Oldest entries were dropped.
        assert_eq!(snapshot.recent_errors[0].message, "e50");
        assert_eq!(snapshot.recent_errors[99].message, "e149");
    }

    #[test]
    fn test_percentiles_over_bounded_ring() {
        let registry = MetricsRegistry::new();
        for i in 1..=100 {
            registry.record_completed("upscale", "w1", Duration::from_secs(i));
        }

        let timing = registry.snapshot().processing_time;
        assert_eq!(timing.count, 100);
        assert!(timing.p50_secs >= 45.0 && timing.p50_secs <= 55.0);
        assert!(timing.p90_secs >= 85.0 && timing.p90_secs <= 95.0);
        assert!(timing.p95_secs >= 90.0 && timing.p95_secs <= 100.0);
        assert!(timing.p99_secs >= 95.0 && timing.p99_secs <= 100.0);
    }

    #[test]
    fn test_ring_keeps_only_recent_samples() {
        let registry = MetricsRegistry::new();
        // 200 slow samples, then 100 fast ones; percentiles should reflect
        // only the recent fast window while min/max cover everything.
        for _ in 0..200 {
            registry.record_completed("upscale", "w1", Duration::from_secs(100));
        }
        for _ in 0..100 {
            registry.record_completed("upscale", "w1", Duration::from_secs(1));
        }

        let timing = registry.snapshot().processing_time;
        assert_eq!(timing.count, 300);
        assert_eq!(timing.max_secs, 100.0);
        assert_eq!(timing.min_secs, 1.0);
        assert_eq!(timing.p99_secs, 1.0);
    }

    #[test]
    fn test_empty_timing_snapshot() {
        let registry = MetricsRegistry::new();
        let timing = registry.snapshot().processing_time;
        assert_eq!(timing.count, 0);
        assert_eq!(timing.p50_secs, 0.0);
    }

    #[test]
    fn test_thread_safety() {
        let registry = Arc::new(MetricsRegistry::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    registry.record_created("upscale");
                    registry.record_completed("upscale", "w1", Duration::from_millis(10));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.jobs_created, 8000);
        assert_eq!(snapshot.jobs_completed, 8000);
        assert_eq!(snapshot.kinds["upscale"].completed, 8000);
    }
}
