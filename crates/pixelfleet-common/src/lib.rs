//! Pixelfleet Common Types
//!
//! This crate provides the shared vocabulary of the pixelfleet middleware:
//! the error taxonomy, the configuration surface, the job model, the graph
//! templates and rewriter, and the wire types of the upstream worker contract.
//!
//! # Overview
//!
//! Pixelfleet sits between HTTP clients and a small fleet of upstream
//! image-processing workers. Every other crate in the workspace builds on the
//! types defined here:
//!
//! - [`error`] - [`FleetError`](error::FleetError) and the crate-wide `Result` alias
//! - [`config`] - [`FleetConfig`](config::FleetConfig), the single configuration struct
//! - [`job`] - job identity, kinds, states and transition rules
//! - [`graph`] - per-kind graph templates and the submission rewriter
//! - [`upstream`] - serde types for the worker's HTTP and streaming endpoints
//!
//! # Example
//!
//! ```
//! use pixelfleet_common::job::{Job, JobInput, JobKind, ImageFormat};
//!
//! let input = JobInput {
//!     image_b64: "aGVsbG8=".to_string(),
//!     format: ImageFormat::Png,
//!     crop: false,
//! };
//! let job = Job::new(JobKind::RemoveBackground, input);
//! assert!(job.state.is_pending());
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod job;
pub mod upstream;

pub use config::FleetConfig;
pub use error::{ErrorKind, FleetError, Result};
pub use job::{ImageFormat, Job, JobId, JobInput, JobKind, JobState};
