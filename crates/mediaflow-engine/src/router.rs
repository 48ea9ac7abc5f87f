//! Input routing from upstream results into a node's typed input bag
//!
//! Each incoming edge is classified by the [`HandleKind`] of its target handle.
//! A source without a result, or a result without the expected field, is
//! skipped: the slot keeps its default and the dispatcher decides whether the
//! node can still run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{HandleKind, ResultTable, WorkflowGraph};

/// Typed inputs collected for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInputs {
    /// Every image routed in, in edge order
    pub image_urls: Vec<String>,
    /// The last image routed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    /// Text routed through a handle without a role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeInputs {
    /// Snapshot used for run records
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Non-empty string field of an upstream output
fn string_field<'a>(output: &'a Value, key: &str) -> Option<&'a str> {
    output
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Text produced by an upstream node: a text node's `text`, or an LLM's `response`
fn text_of(output: &Value) -> Option<&str> {
    string_field(output, "text").or_else(|| string_field(output, "response"))
}

/// Collect the inputs of `node_id` from results produced so far
pub fn resolve_inputs(node_id: &str, graph: &WorkflowGraph, results: &ResultTable) -> NodeInputs {
    let mut inputs = NodeInputs::default();

    for edge in graph.incoming_edges(node_id) {
        let Some(output) = results
            .get(&edge.source)
            .and_then(|result| result.output.as_ref())
        else {
            log::debug!(
                "Node '{}': no output from '{}' for edge '{}', skipping",
                node_id,
                edge.source,
                edge.id
            );
            continue;
        };
        if graph.find_node(&edge.source).is_none() {
            continue;
        }

        match edge.target_kind {
            HandleKind::Image => {
                if let Some(url) = string_field(output, "url") {
                    inputs.image_urls.push(url.to_string());
                    inputs.image_url = Some(url.to_string());
                }
            }
            HandleKind::Video => {
                if let Some(url) = string_field(output, "url") {
                    inputs.video_url = Some(url.to_string());
                }
            }
            HandleKind::TextSystem => {
                if let Some(text) = text_of(output) {
                    inputs.system_prompt = Some(text.to_string());
                }
            }
            HandleKind::TextUser => {
                if let Some(text) = text_of(output) {
                    inputs.user_message = Some(text.to_string());
                }
            }
            HandleKind::TextGeneric => {
                if let Some(text) = text_of(output) {
                    inputs.text = Some(text.to_string());
                }
            }
            HandleKind::Other => {}
        }
    }

    inputs
}
