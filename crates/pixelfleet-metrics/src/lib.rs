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

//! Pixelfleet Metrics Aggregation
//!
//! Thread-safe metrics for the job pipeline: job counters (created, completed,
//! failed) globally, per worker and per kind; processing-time running stats
//! with percentile estimation over a bounded recent-sample ring; and a bounded
//! list of recent errors.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: storage with lock-free counters on the hot path
//! - [`MetricsSnapshot`]: serializable snapshot of the current state
//! - [`persist`]: atomic snapshot-to-file persistence (temp file + rename)
//!
//! # Thread Safety
//!
//! The registry uses atomics for counter increments and short `RwLock`/`Mutex`
//! critical sections for map and ring access; nothing is awaited under a lock.
//! Share it across tasks with `Arc`.

mod registry;
mod snapshot;

pub mod persist;

pub use registry::MetricsRegistry;
pub use snapshot::{ErrorRecord, KindMetrics, MetricsSnapshot, TimingSnapshot, WorkerMetrics};
