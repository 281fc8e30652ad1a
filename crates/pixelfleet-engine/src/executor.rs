//! Per-job execution protocol.
//!
//! Given a job and its assigned worker: rewrite the graph template, submit it,
//! watch the worker's stream for a completion or error signal, fetch the
//! history entry, download the produced image, optionally mirror it to disk,
//! and commit the outcome to the registry. Stream handling is a single receive
//! loop driving a small per-submission state machine; there is no handler
//! registration surface.

use crate::registry::{JobPatch, JobRegistry};
use crate::worker::Worker;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pixelfleet_common::error::{FleetError, Result};
use pixelfleet_common::graph::{self, PreparedGraph};
use pixelfleet_common::job::{Job, JobFailure, JobOutcome, JobState};
use pixelfleet_common::upstream::StreamEvent;
use pixelfleet_metrics::MetricsRegistry;
use pixelfleet_worker::WorkerStream;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared dependencies of every job task.
pub struct ExecutionEnv {
    pub registry: Arc<JobRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    /// Hard ceiling from stream acquisition to completion signal.
    pub execution_timeout: Duration,
    /// Deadline for each individual upstream HTTP call.
    pub call_timeout: Duration,
    /// Pause between completion signal and history fetch, letting the worker
    /// flush its outputs.
    pub settle_delay: Duration,
    pub output_files: bool,
    pub output_dir: PathBuf,
}

/// Runs one job to a terminal state and commits the verdict.
///
/// This is the task body spawned by the scheduler; it never returns an error.
/// Worker-health policy is applied here: transport-class failures mark the
/// worker unhealthy and count against its breaker, graph-fault failures do
/// not.
pub async fn run_job(env: Arc<ExecutionEnv>, worker: Arc<Worker>, job: Job) {
    let job_id = job.id;
    let kind = job.kind;
    let started_at = job.processing_started_at;

    match execute(&env, &worker, &job).await {
        Ok(outcome) => {
            worker.breaker.record_success();
            let processing_time = started_at
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            env.metrics
                .record_completed(kind.as_str(), &worker.id, processing_time);
            info!(
                job = %job_id,
                worker = %worker.id,
                secs = processing_time.as_secs_f64(),
                "job completed"
            );
            let committed = env.registry.transition(
                job_id,
                JobState::Completed,
                JobPatch {
                    result: Some(outcome),
                    ..Default::default()
                },
            );
            if let Err(e) = committed {
                warn!(job = %job_id, "could not commit completed job: {e}");
            }
        }
        Err(e) => {
            if e.marks_worker_unhealthy() {
                worker.mark_unhealthy(&e.to_string());
                worker.breaker.record_failure();
            } else {
                // The worker answered; the graph or data was at fault.
                worker.breaker.record_success();
            }
            env.metrics.record_failed(
                kind.as_str(),
                Some(&worker.id),
                e.kind().as_str(),
                &e.to_string(),
            );
            warn!(job = %job_id, worker = %worker.id, "job failed: {e}");
            let committed = env.registry.transition(
                job_id,
                JobState::Failed,
                JobPatch {
                    error: Some(JobFailure::from_error(&e)),
                    ..Default::default()
                },
            );
            if let Err(e) = committed {
                // The job may have been evicted as stuck in the meantime.
                debug!(job = %job_id, "could not commit failed job: {e}");
            }
        }
    }
}

/// The protocol proper. Acquires a pooled stream (the execution deadline runs
/// from here), submits with the stream's client id, and drives retrieval.
async fn execute(env: &ExecutionEnv, worker: &Arc<Worker>, job: &Job) -> Result<JobOutcome> {
    let prepared = graph::prepare(job.kind, &job.input, &job.fingerprint)?;

    let mut stream = worker.pool.acquire().await?;
    let deadline = Instant::now() + env.execution_timeout;
    let result = drive(env, worker, job, &prepared, &mut stream, deadline).await;
    worker.pool.release(stream).await;
    result
}

async fn drive(
    env: &ExecutionEnv,
    worker: &Arc<Worker>,
    job: &Job,
    prepared: &PreparedGraph,
    stream: &mut WorkerStream,
    deadline: Instant,
) -> Result<JobOutcome> {
    let response = worker
        .client
        .submit_prompt(prepared.graph.clone(), &stream.client_id, env.call_timeout)
        .await?;
    let prompt_id = response.prompt_id;
    env.registry.note_submission(job.id, &prompt_id);
    debug!(job = %job.id, prompt = %prompt_id, "graph submitted");

    monitor_stream(stream, &prompt_id, deadline, env.execution_timeout).await?;

    // Let the worker flush its outputs before asking for them.
    tokio::time::sleep(env.settle_delay).await;

    let entry = worker
        .client
        .fetch_history(&prompt_id, env.call_timeout)
        .await?;
    let image = entry
        .pick_image(&prepared.target_node)
        .ok_or_else(|| {
            FleetError::MissingOutput(format!("prompt {prompt_id} produced no images"))
        })?
        .clone();

    let (bytes, content_type) = worker.client.download_view(&image, env.call_timeout).await?;

    if env.output_files {
        write_output(env, &prompt_id, &image.filename, &bytes).await;
    }

    Ok(JobOutcome {
        image: format!("data:{content_type};base64,{}", BASE64.encode(&bytes)),
        content_type,
        filename: image.filename,
        prompt_id,
    })
}

/// Watches the stream until our submission completes or fails.
///
/// Completion is either an `executing` event with `node = None` for our
/// prompt, or a `status` event reporting an empty queue (completion by
/// cache). Events for other prompt ids are ignored; binary frames never reach
/// this loop.
async fn monitor_stream(
    stream: &mut WorkerStream,
    prompt_id: &str,
    deadline: Instant,
    execution_timeout: Duration,
) -> Result<()> {
    let timeout_err = || FleetError::Timeout(execution_timeout.as_millis() as u64);
    let mut will_be_cached: HashSet<String> = HashSet::new();
    let mut processing: HashSet<String> = HashSet::new();

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(timeout_err)?;

        let event = match stream.next_event(remaining).await {
            Ok(event) => event,
            Err(FleetError::Timeout(_)) => return Err(timeout_err()),
            Err(e) => return Err(e),
        };

        match event {
            StreamEvent::ExecutionCached {
                prompt_id: pid,
                nodes,
            } if pid == prompt_id => {
                will_be_cached.extend(nodes);
            }
            StreamEvent::Executing {
                prompt_id: Some(pid),
                node,
            } if pid == prompt_id => match node {
                Some(node) => {
                    processing.insert(node);
                }
                None => {
                    debug!(
                        prompt = %prompt_id,
                        executed = processing.len(),
                        cached = will_be_cached.len(),
                        "submission completed"
                    );
                    return Ok(());
                }
            },
            StreamEvent::Status {
                queue_remaining: Some(0),
            } => {
                // Queue drained without per-node events for us: everything
                // was served from the worker cache.
                debug!(prompt = %prompt_id, "submission completed by queue drain");
                return Ok(());
            }
            StreamEvent::ExecutionError {
                prompt_id: pid,
                message,
                ..
            } if pid == prompt_id => {
                return Err(FleetError::UpstreamExecution(message));
            }
            _ => {}
        }
    }
}

/// Optional disk sink; failures are logged and swallowed.
async fn write_output(env: &ExecutionEnv, prompt_id: &str, filename: &str, bytes: &[u8]) {
    let dir = env.output_dir.join(prompt_id);
    let write = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(filename), bytes).await
    };
    if let Err(e) = write.await {
        warn!(prompt = %prompt_id, "output file sink failed: {e}");
    }
}
