//! Pixelfleet HTTP Surface
//!
//! The northbound API of the middleware, built on axum. Three groups of
//! routes, all backed by the shared [`Engine`](pixelfleet_engine::Engine):
//!
//! - **Processing** - multipart image upload per pipeline kind, synchronous
//!   (wait for the result) or asynchronous (job handle)
//! - **Job tracking** - status, result, listing, deletion, cleanup, stats
//! - **Operational** - health, status, metrics, circuit-breaker admin

pub mod handlers;
pub mod server;

pub use server::{build_router, serve};
