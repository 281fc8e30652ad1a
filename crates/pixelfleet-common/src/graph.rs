//! Graph templates and the submission rewriter.
//!
//! The upstream workers consume node-dataflow graphs. The middleware treats
//! them as opaque JSON trees and knows exactly two semantic hooks: the input
//! node whose `_meta.title` is the [`INPUT_IMAGE_SENTINEL`], and save nodes
//! whose `class_type` contains [`SAVE_IMAGE_CLASS`]. Everything else passes
//! through untouched.

use crate::error::{FleetError, Result};
use crate::job::{JobInput, JobKind};
use serde_json::{json, Value};

/// `_meta.title` marking the node that receives the uploaded image.
pub const INPUT_IMAGE_SENTINEL: &str = "InputImageBase64";

/// Substring of `class_type` marking nodes whose `filename_prefix` gets the
/// per-submission token.
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";

/// A built-in graph template for one job kind.
pub struct GraphTemplate {
    pub graph: Value,
    /// Node id whose outputs hold the workflow-defined result.
    pub target_node: &'static str,
}

/// A template rewritten for one concrete submission.
#[derive(Debug, Clone)]
pub struct PreparedGraph {
    pub graph: Value,
    pub target_node: String,
}

/// Returns the built-in template for `kind`.
pub fn template(kind: JobKind) -> GraphTemplate {
    match kind {
        JobKind::RemoveBackground => GraphTemplate {
            graph: json!({
                "1": {
                    "class_type": "ETN_LoadImageBase64",
                    "_meta": { "title": "InputImageBase64" },
                    "inputs": { "image": "" }
                },
                "2": {
                    "class_type": "InspyrenetRembg",
                    "_meta": { "title": "Remove Background" },
                    "inputs": { "image": ["1", 0], "crop": false }
                },
                "3": {
                    "class_type": "SaveImage",
                    "_meta": { "title": "Save Result" },
                    "inputs": {
                        "images": ["2", 0],
                        "filename_prefix": "pixelfleet/rembg",
                        "format": "PNG"
                    }
                }
            }),
            target_node: "3",
        },
        JobKind::Upscale => GraphTemplate {
            graph: json!({
                "1": {
                    "class_type": "ETN_LoadImageBase64",
                    "_meta": { "title": "InputImageBase64" },
                    "inputs": { "image": "" }
                },
                "2": {
                    "class_type": "UpscaleModelLoader",
                    "_meta": { "title": "Load Upscale Model" },
                    "inputs": { "model_name": "4x_foolhardy_Remacri.pth" }
                },
                "3": {
                    "class_type": "ImageUpscaleWithModel",
                    "_meta": { "title": "Upscale Image" },
                    "inputs": { "upscale_model": ["2", 0], "image": ["1", 0] }
                },
                "4": {
                    "class_type": "SaveImage",
                    "_meta": { "title": "Save Result" },
                    "inputs": {
                        "images": ["3", 0],
                        "filename_prefix": "pixelfleet/upscale",
                        "format": "PNG"
                    }
                }
            }),
            target_node: "4",
        },
        JobKind::UpscaleRemoveBackground => GraphTemplate {
            graph: json!({
                "1": {
                    "class_type": "ETN_LoadImageBase64",
                    "_meta": { "title": "InputImageBase64" },
                    "inputs": { "image": "" }
                },
                "2": {
                    "class_type": "UpscaleModelLoader",
                    "_meta": { "title": "Load Upscale Model" },
                    "inputs": { "model_name": "4x_foolhardy_Remacri.pth" }
                },
                "3": {
                    "class_type": "ImageUpscaleWithModel",
                    "_meta": { "title": "Upscale Image" },
                    "inputs": { "upscale_model": ["2", 0], "image": ["1", 0] }
                },
                "4": {
                    "class_type": "InspyrenetRembg",
                    "_meta": { "title": "Remove Background" },
                    "inputs": { "image": ["3", 0], "crop": false }
                },
                "5": {
                    "class_type": "SaveImage",
                    "_meta": { "title": "Save Result" },
                    "inputs": {
                        "images": ["4", 0],
                        "filename_prefix": "pixelfleet/upscale_rembg",
                        "format": "PNG"
                    }
                }
            }),
            target_node: "5",
        },
    }
}

/// Strips a `data:<mime>;base64,` prefix if present.
pub fn strip_data_url(payload: &str) -> &str {
    match payload.find(";base64,") {
        Some(idx) if payload.starts_with("data:") => &payload[idx + ";base64,".len()..],
        _ => payload,
    }
}

/// Rewrites the template for `kind` into a concrete submission graph.
///
/// - Writes the (prefix-stripped) image payload into every sentinel node.
/// - Suffixes every save node's `filename_prefix` with the job fingerprint,
///   so the upstream cache treats each submission as fresh.
/// - Applies `format` and `crop` to nodes that declare those inputs.
pub fn prepare(kind: JobKind, input: &JobInput, fingerprint: &str) -> Result<PreparedGraph> {
    let GraphTemplate { graph, target_node } = template(kind);
    let mut graph = graph;
    let payload = strip_data_url(&input.image_b64).to_string();

    let nodes = graph
        .as_object_mut()
        .ok_or_else(|| FleetError::Validation("graph template is not an object".to_string()))?;

    let mut sentinel_found = false;
    for node in nodes.values_mut() {
        let is_sentinel = node
            .pointer("/_meta/title")
            .and_then(Value::as_str)
            .map(|t| t == INPUT_IMAGE_SENTINEL)
            .unwrap_or(false);
        let class = node
            .get("class_type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };

        if is_sentinel {
            inputs.insert("image".to_string(), Value::String(payload.clone()));
            sentinel_found = true;
        }
        if class.contains(SAVE_IMAGE_CLASS) {
            let prefix = inputs
                .get("filename_prefix")
                .and_then(Value::as_str)
                .unwrap_or("pixelfleet");
            let suffixed = format!("{prefix}_{fingerprint}");
            inputs.insert("filename_prefix".to_string(), Value::String(suffixed));
        }
        if inputs.contains_key("format") {
            inputs.insert(
                "format".to_string(),
                Value::String(input.format.as_str().to_string()),
            );
        }
        if inputs.contains_key("crop") && kind.supports_crop() {
            inputs.insert("crop".to_string(), Value::Bool(input.crop));
        }
    }

    if !sentinel_found {
        return Err(FleetError::Validation(format!(
            "template for {kind} has no {INPUT_IMAGE_SENTINEL} node"
        )));
    }

    Ok(PreparedGraph {
        graph,
        target_node: target_node.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ImageFormat;

    fn input(payload: &str) -> JobInput {
        JobInput {
            image_b64: payload.to_string(),
            format: ImageFormat::Webp,
            crop: true,
        }
    }

    #[test]
    fn test_prepare_injects_image_into_sentinel() {
        let prepared =
            prepare(JobKind::RemoveBackground, &input("AAAA"), "job_abc_1").unwrap();
        assert_eq!(
            prepared.graph.pointer("/1/inputs/image").unwrap(),
            &Value::String("AAAA".to_string())
        );
    }

    #[test]
    fn test_prepare_strips_data_url_prefix() {
        let prepared = prepare(
            JobKind::RemoveBackground,
            &input("data:image/png;base64,QkJCQg=="),
            "job_abc_1",
        )
        .unwrap();
        assert_eq!(
            prepared.graph.pointer("/1/inputs/image").unwrap(),
            &Value::String("QkJCQg==".to_string())
        );
    }

    #[test]
    fn test_prepare_suffixes_save_prefix_with_fingerprint() {
        let prepared =
            prepare(JobKind::Upscale, &input("AAAA"), "job_deadbeef_42").unwrap();
        let prefix = prepared
            .graph
            .pointer("/4/inputs/filename_prefix")
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(prefix, "pixelfleet/upscale_job_deadbeef_42");
    }

    #[test]
    fn test_two_submissions_get_distinct_prefixes() {
        let a = prepare(JobKind::Upscale, &input("AAAA"), "job_a_1").unwrap();
        let b = prepare(JobKind::Upscale, &input("AAAA"), "job_b_2").unwrap();
        assert_ne!(
            a.graph.pointer("/4/inputs/filename_prefix"),
            b.graph.pointer("/4/inputs/filename_prefix")
        );
    }

    #[test]
    fn test_prepare_applies_format() {
        let prepared = prepare(JobKind::Upscale, &input("AAAA"), "fp").unwrap();
        assert_eq!(
            prepared.graph.pointer("/4/inputs/format").unwrap(),
            &Value::String("WEBP".to_string())
        );
    }

    #[test]
    fn test_prepare_applies_crop_only_where_supported() {
        let prepared = prepare(JobKind::RemoveBackground, &input("AAAA"), "fp").unwrap();
        assert_eq!(
            prepared.graph.pointer("/2/inputs/crop").unwrap(),
            &Value::Bool(true)
        );

        // The plain upscale template has no crop-taking node; the flag is a
        // no-op rather than an error.
        let prepared = prepare(JobKind::Upscale, &input("AAAA"), "fp").unwrap();
        assert!(prepared.graph.pointer("/3/inputs/crop").is_none());
    }

    #[test]
    fn test_prepare_leaves_unknown_nodes_untouched() {
        let prepared = prepare(JobKind::Upscale, &input("AAAA"), "fp").unwrap();
        assert_eq!(
            prepared.graph.pointer("/2/inputs/model_name").unwrap(),
            &Value::String("4x_foolhardy_Remacri.pth".to_string())
        );
    }

    #[test]
    fn test_target_nodes_are_save_nodes() {
        for kind in JobKind::all() {
            let tpl = template(kind);
            let class = tpl
                .graph
                .pointer(&format!("/{}/class_type", tpl.target_node))
                .and_then(Value::as_str)
                .unwrap();
            assert!(class.contains(SAVE_IMAGE_CLASS));
        }
    }

    #[test]
    fn test_strip_data_url() {
        assert_eq!(strip_data_url("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_url("AAAA"), "AAAA");
        // A payload that merely contains the marker but is not a data URL is
        // left alone.
        assert_eq!(strip_data_url("x;base64,AAAA"), "x;base64,AAAA");
    }
}
