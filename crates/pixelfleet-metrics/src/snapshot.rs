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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job counters for one worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    /// Dispatch-time gate failures (probe failed, worker skipped).
    pub dispatch_failures: u64,
}

/// Job counters for one job kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindMetrics {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Processing-time statistics, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub avg_secs: f64,
    pub p50_secs: f64,
    pub p90_secs: f64,
    pub p95_secs: f64,
    pub p99_secs: f64,
}

/// One entry in the bounded recent-errors list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp, milliseconds.
    pub timestamp_ms: u64,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub message: String,
}

/// Complete metrics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub uptime_ms: u64,
    pub processing_time: TimingSnapshot,
    pub workers: HashMap<String, WorkerMetrics>,
    pub kinds: HashMap<String, KindMetrics>,
    pub recent_errors: Vec<ErrorRecord>,
}
