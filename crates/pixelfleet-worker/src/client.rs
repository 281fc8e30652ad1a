use pixelfleet_common::error::{FleetError, Result};
use pixelfleet_common::upstream::{HistoryEntry, ImageRef, PromptRequest, PromptResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// HTTP client for one upstream worker.
///
/// Wraps a shared `reqwest::Client` (one per process, so connection reuse
/// spans workers) and the worker's base URL. Every call takes an explicit
/// deadline; transport failures map into the fleet error taxonomy.
#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    worker_id: String,
    base_url: String,
}

impl WorkerClient {
    /// Creates a client for `host` (a `host:port` string).
    pub fn new(http: reqwest::Client, worker_id: &str, scheme: &str, host: &str) -> Self {
        Self {
            http,
            worker_id: worker_id.to_string(),
            base_url: format!("{scheme}://{host}"),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Submits a graph and returns the upstream submission id.
    ///
    /// A non-empty node-error mapping (or a 4xx response) is a validation
    /// failure: the graph is at fault, not the worker.
    pub async fn submit_prompt(
        &self,
        graph: Value,
        client_id: &str,
        timeout: Duration,
    ) -> Result<PromptResponse> {
        let body = PromptRequest {
            prompt: graph,
            client_id: client_id.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(FleetError::Validation(format!(
                "worker {} rejected prompt ({status}): {detail}",
                self.worker_id
            )));
        }
        if !status.is_success() {
            return Err(FleetError::Transport(format!(
                "worker {} prompt returned {status}",
                self.worker_id
            )));
        }

        let parsed: PromptResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        if !parsed.node_errors.is_empty() {
            return Err(FleetError::Validation(format!(
                "worker {} reported node errors: {}",
                self.worker_id,
                serde_json::to_string(&parsed.node_errors).unwrap_or_default()
            )));
        }
        debug!(
            worker = %self.worker_id,
            prompt_id = %parsed.prompt_id,
            "prompt accepted"
        );
        Ok(parsed)
    }

    /// Fetches the history entry for a finished submission.
    ///
    /// Failures here happen after apparent completion, so they map to the
    /// download-failure / missing-output kinds rather than transport.
    pub async fn fetch_history(&self, prompt_id: &str, timeout: Duration) -> Result<HistoryEntry> {
        let response = self
            .http
            .get(format!("{}/history/{prompt_id}", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FleetError::DownloadFailure(format!("history fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FleetError::DownloadFailure(format!(
                "history fetch returned {}",
                response.status()
            )));
        }

        let mut entries: HashMap<String, HistoryEntry> = response
            .json()
            .await
            .map_err(|e| FleetError::DownloadFailure(format!("history parse failed: {e}")))?;
        entries.remove(prompt_id).ok_or_else(|| {
            FleetError::MissingOutput(format!("no history entry for prompt {prompt_id}"))
        })
    }

    /// Downloads one produced file. Returns the raw bytes and the
    /// content-type reported by the worker.
    pub async fn download_view(
        &self,
        image: &ImageRef,
        timeout: Duration,
    ) -> Result<(Vec<u8>, String)> {
        let response = self
            .http
            .get(format!("{}/view", self.base_url))
            .timeout(timeout)
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FleetError::DownloadFailure(format!("view download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FleetError::DownloadFailure(format!(
                "view download returned {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FleetError::DownloadFailure(format!("view body read failed: {e}")))?;
        Ok((bytes.to_vec(), content_type))
    }

    /// Liveness probe: any 2xx from the stats endpoint counts as alive.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/system_stats", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(FleetError::Transport(format!(
                "worker {} stats returned {}",
                self.worker_id,
                response.status()
            )))
        }
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> FleetError {
    if err.is_timeout() {
        FleetError::Timeout(timeout.as_millis() as u64)
    } else {
        FleetError::Transport(err.to_string())
    }
}
