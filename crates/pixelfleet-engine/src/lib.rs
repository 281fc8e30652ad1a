//! Pixelfleet Engine
//!
//! The concurrent job pipeline: the part of the middleware that sits between
//! the northbound HTTP surface and the upstream worker fleet.
//!
//! # Architecture
//!
//! Incoming work flows through five cooperating components, all owned by one
//! explicitly constructed [`Engine`]:
//!
//! 1. **Job Registry** ([`registry`]) - source of truth for job existence,
//!    state and results; enforces the `pending -> processing -> terminal`
//!    lifecycle and per-job cleanup timers
//! 2. **Scheduler** ([`scheduler`]) - a single cooperative loop that drains
//!    pending jobs under the global and per-worker concurrency caps
//! 3. **Load Balancer** ([`balancer`]) - least-loaded selection over
//!    dispatchable workers, gated by a real-time health probe
//! 4. **Health Monitor + Circuit Breakers** ([`health`], [`breaker`]) -
//!    cached liveness with background probing, and fail-fast policy per
//!    worker with exponential back-off recovery
//! 5. **Execution Protocol** ([`executor`]) - per-job submit, stream watch,
//!    result retrieval and commit
//!
//! # Key Design Decisions
//!
//! ## Waiting is not failure
//!
//! When no worker is dispatchable the scheduler leaves jobs pending and
//! retries next tick; only the per-job deadline evicts. Clients polling the
//! status endpoint see `pending` rather than spurious failures during brief
//! fleet outages.
//!
//! ## One receive loop per lent stream
//!
//! Stream handling is a plain receive loop driving a local state machine for
//! the one submission that borrowed the stream. There is no event-emitter or
//! handler-registration surface to keep consistent.
//!
//! ## Explicit context over globals
//!
//! Registry, balancer, scheduler and metrics are constructed once and owned
//! by the [`Engine`]; request handlers receive the context instead of
//! reaching for singletons.

pub mod balancer;
pub mod breaker;
pub mod engine;
pub mod executor;
pub mod health;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use balancer::LoadBalancer;
pub use breaker::{Admission, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use engine::Engine;
pub use health::{HealthConfig, HealthMonitor};
pub use registry::{JobFilter, JobPatch, JobRegistry, RegistryStats};
pub use scheduler::Scheduler;
pub use worker::{Worker, WorkerSnapshot};
