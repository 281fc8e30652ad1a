//! Pixelfleet Worker Client
//!
//! Everything that talks to one upstream image-processing worker lives here:
//!
//! - [`client::WorkerClient`] - the four HTTP endpoints (`/prompt`,
//!   `/history/<id>`, `/view`, `/system_stats`)
//! - [`stream::WorkerStream`] - one long-lived streaming channel delivering
//!   progress events
//! - [`pool::StreamPool`] - a bounded, health-monitored set of streams per
//!   worker, lent out one submission at a time
//!
//! The crate maps every transport condition into the shared
//! [`FleetError`](pixelfleet_common::FleetError) taxonomy so the engine can
//! apply policy (mark unhealthy, count toward the breaker) without inspecting
//! reqwest or WebSocket error types.

pub mod client;
pub mod pool;
pub mod stream;

pub use client::WorkerClient;
pub use pool::{PoolStats, StreamPool, StreamPoolConfig};
pub use stream::WorkerStream;
