//! Wire types for the upstream worker contract.
//!
//! Each worker exposes `POST /prompt`, `GET /history/<prompt_id>`,
//! `GET /view` and `GET /system_stats`, plus a streaming endpoint at
//! `/ws?clientId=<opaque>` that emits JSON progress events. The shapes here
//! are deliberately permissive: fields the middleware does not consume are
//! defaulted or dropped, and unknown stream events parse into
//! [`StreamEvent::Other`] instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Body of `POST /prompt`.
#[derive(Debug, Clone, Serialize)]
pub struct PromptRequest {
    pub prompt: Value,
    pub client_id: String,
}

/// Response of `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: Option<i64>,
    /// Non-empty when the worker rejected individual nodes at validation.
    #[serde(default)]
    pub node_errors: HashMap<String, Value>,
}

/// One entry of `GET /history/<prompt_id>` (the response maps prompt id to
/// this).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: HashMap<String, NodeOutput>,
}

impl HistoryEntry {
    /// Picks the result image: the workflow-defined target node if it yielded
    /// images, otherwise the first node that did.
    pub fn pick_image(&self, target_node: &str) -> Option<&ImageRef> {
        if let Some(image) = self
            .outputs
            .get(target_node)
            .and_then(|node| node.images.first())
        {
            return Some(image);
        }
        // Iteration order over the map is arbitrary; sort for a stable pick.
        let mut nodes: Vec<_> = self.outputs.iter().collect();
        nodes.sort_by(|a, b| a.0.cmp(b.0));
        nodes
            .into_iter()
            .find_map(|(_, node)| node.images.first())
    }
}

/// Outputs of one graph node in a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Location triple identifying one produced file on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: String,
}

/// A progress event observed on a worker stream.
///
/// Only textual frames parse into events; binary frames (preview snapshots)
/// are dropped one layer below.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Preamble listing nodes that will be served from the worker cache.
    ExecutionCached {
        prompt_id: String,
        nodes: Vec<String>,
    },
    /// A node started executing; `node == None` signals normal completion of
    /// the submission.
    Executing {
        prompt_id: Option<String>,
        node: Option<String>,
    },
    /// A node finished and produced outputs.
    Executed { prompt_id: String, node: String },
    /// The submission failed upstream.
    ExecutionError {
        prompt_id: String,
        message: String,
        details: Value,
    },
    /// Queue status; `queue_remaining == 0` means the worker drained its
    /// queue, which the execution protocol may interpret as completion by
    /// cache.
    Status { queue_remaining: Option<u64> },
    /// Anything the middleware does not consume.
    Other { event_type: String },
}

impl StreamEvent {
    /// Parses one textual stream frame. Returns `None` for frames that are
    /// not JSON objects with a `type` field.
    pub fn parse(text: &str) -> Option<StreamEvent> {
        let value: Value = serde_json::from_str(text).ok()?;
        let event_type = value.get("type")?.as_str()?.to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        let event = match event_type.as_str() {
            "execution_cached" => StreamEvent::ExecutionCached {
                prompt_id: str_field(&data, "prompt_id")?,
                nodes: data
                    .get("nodes")
                    .and_then(Value::as_array)
                    .map(|nodes| {
                        nodes
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "executing" => StreamEvent::Executing {
                prompt_id: data
                    .get("prompt_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                node: data.get("node").and_then(Value::as_str).map(str::to_string),
            },
            "executed" => StreamEvent::Executed {
                prompt_id: str_field(&data, "prompt_id")?,
                node: str_field(&data, "node")?,
            },
            "execution_error" => StreamEvent::ExecutionError {
                prompt_id: str_field(&data, "prompt_id")?,
                message: data
                    .get("exception_message")
                    .and_then(Value::as_str)
                    .unwrap_or("execution error")
                    .to_string(),
                details: data,
            },
            "status" => StreamEvent::Status {
                queue_remaining: data
                    .pointer("/status/exec_info/queue_remaining")
                    .and_then(Value::as_u64),
            },
            _ => StreamEvent::Other { event_type },
        };
        Some(event)
    }
}

fn str_field(data: &Value, field: &str) -> Option<String> {
    data.get(field).and_then(Value::as_str).map(str::to_string)
}
