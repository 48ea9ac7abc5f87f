//! Core types for workflow graphs
//!
//! These types define the graph snapshot a run executes: typed nodes, edges
//! with pre-parsed handle kinds, and the per-node results a run produces.
//!
//! Nodes travel over the wire as `{id, type, data}` and are decoded into a
//! [`NodeKind`] once, at ingestion. Edges are decoded the same way and carry
//! the [`HandleKind`] of their target handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Results accumulated by a run, keyed by node id
pub type ResultTable = HashMap<NodeId, NodeResult>;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Semantic kind of an edge handle.
///
/// Handles are strings of the form `<kind>:<detail>`, e.g. `image:input`,
/// `video:input`, `text:system`, `text:user`, `text:output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    /// Image URL
    Image,
    /// Video URL
    Video,
    /// System prompt text
    TextSystem,
    /// User message text
    TextUser,
    /// Any other text
    TextGeneric,
    /// Missing or unrecognised handle
    Other,
}

impl HandleKind {
    /// Parse a handle string
    pub fn parse(handle: &str) -> Self {
        let (prefix, detail) = match handle.split_once(':') {
            Some((prefix, detail)) => (prefix, detail),
            None => (handle, ""),
        };

        match prefix.trim() {
            "image" => Self::Image,
            "video" => Self::Video,
            "text" => {
                let role = detail.trim();
                if role.starts_with("system") {
                    Self::TextSystem
                } else if role.starts_with("user") {
                    Self::TextUser
                } else {
                    Self::TextGeneric
                }
            }
            _ => Self::Other,
        }
    }

    /// Parse an optional handle (the editor sends `null` for untyped handles)
    pub fn from_optional(handle: Option<&str>) -> Self {
        handle.map(Self::parse).unwrap_or(Self::Other)
    }
}

// ---------------------------------------------------------------------------
// Node configuration
// ---------------------------------------------------------------------------

/// A scalar the editor sends either as a number or as a string.
///
/// Used for crop percentages (`10`, `"10"`, `"10%"`) and frame timestamps
/// (`"50%"`, `"12.5"`, `3`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Measure {
    Number(serde_json::Number),
    Text(String),
}

impl Measure {
    /// Create a textual measure
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Create a numeric measure from an integer
    pub fn int(value: i64) -> Self {
        Self::Number(value.into())
    }

    /// Whether the measure carries no value (an empty string)
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(s) if s.trim().is_empty())
    }

    /// Whether the measure is written as a percentage (`"50%"`)
    pub fn is_percent_literal(&self) -> bool {
        matches!(self, Self::Text(s) if s.trim().ends_with('%'))
    }

    /// Numeric value with any trailing `%` removed
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::Text(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Configuration of a static text node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Configuration of an image or video upload node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    /// URL of the already-uploaded file
    #[serde(
        default,
        alias = "imageUrl",
        alias = "videoUrl",
        skip_serializing_if = "Option::is_none"
    )]
    pub url: Option<String>,
}

/// Configuration of a crop node (percentages of the source image)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropConfig {
    /// Fallback image when no image edge is connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<Measure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<Measure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<Measure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<Measure>,
}

/// Configuration of a frame extraction node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractFrameConfig {
    /// Fallback video when no video edge is connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Seconds, or a percentage of the video duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Measure>,
}

/// Configuration of an LLM node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Prompt used when no user-message edge is connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The closed set of node variants, each with its own configuration
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    TextSource(TextSourceConfig),
    ImageUpload(UploadConfig),
    VideoUpload(UploadConfig),
    Crop(CropConfig),
    ExtractFrame(ExtractFrameConfig),
    Llm(LlmConfig),
    /// A type this engine does not know; dispatched as a pass-through
    Unknown {
        type_name: Option<String>,
        data: Value,
    },
}

impl NodeKind {
    /// Decode a node from its wire type tag and data bag
    pub fn decode(node_id: &str, type_name: Option<&str>, data: Value) -> Result<Self, GraphError> {
        let data = if data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            data
        };

        let Some(tag) = type_name else {
            return Ok(Self::Unknown { type_name: None, data });
        };

        fn config<T: serde::de::DeserializeOwned>(
            node_id: &str,
            tag: &str,
            data: Value,
        ) -> Result<T, GraphError> {
            serde_json::from_value(data).map_err(|e| GraphError::InvalidNodeData {
                node_id: node_id.to_string(),
                node_type: tag.to_string(),
                message: e.to_string(),
            })
        }

        let kind = match tag {
            "textNode" | "textSource" => Self::TextSource(config(node_id, tag, data)?),
            "uploadImageNode" | "imageUpload" => Self::ImageUpload(config(node_id, tag, data)?),
            "uploadVideoNode" | "videoUpload" => Self::VideoUpload(config(node_id, tag, data)?),
            "cropNode" | "crop" => Self::Crop(config(node_id, tag, data)?),
            "extractNode" | "extractFrame" => Self::ExtractFrame(config(node_id, tag, data)?),
            "llmNode" | "llm" => Self::Llm(config(node_id, tag, data)?),
            other => Self::Unknown {
                type_name: Some(other.to_string()),
                data,
            },
        };
        Ok(kind)
    }

    /// Wire type tag (the editor's names)
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::TextSource(_) => Some("textNode"),
            Self::ImageUpload(_) => Some("uploadImageNode"),
            Self::VideoUpload(_) => Some("uploadVideoNode"),
            Self::Crop(_) => Some("cropNode"),
            Self::ExtractFrame(_) => Some("extractNode"),
            Self::Llm(_) => Some("llmNode"),
            Self::Unknown { type_name, .. } => type_name.as_deref(),
        }
    }

    /// Encode the configuration back into a data bag
    pub fn to_data(&self) -> Value {
        let encoded = match self {
            Self::TextSource(c) => serde_json::to_value(c),
            Self::ImageUpload(c) | Self::VideoUpload(c) => serde_json::to_value(c),
            Self::Crop(c) => serde_json::to_value(c),
            Self::ExtractFrame(c) => serde_json::to_value(c),
            Self::Llm(c) => serde_json::to_value(c),
            Self::Unknown { data, .. } => return data.clone(),
        };
        encoded.unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Wire shape of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: NodeId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    node_type: Option<String>,
    #[serde(default)]
    data: Value,
}

/// A node instance in a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct GraphNode {
    /// Unique identifier for this node instance
    pub id: NodeId,
    /// Variant and configuration
    pub kind: NodeKind,
}

impl GraphNode {
    /// Create a node from an id and a decoded kind
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self { id: id.into(), kind }
    }
}

impl TryFrom<RawNode> for GraphNode {
    type Error = GraphError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let kind = NodeKind::decode(&raw.id, raw.node_type.as_deref(), raw.data)?;
        Ok(Self { id: raw.id, kind })
    }
}

impl From<GraphNode> for RawNode {
    fn from(node: GraphNode) -> Self {
        Self {
            node_type: node.kind.type_name().map(str::to_string),
            data: node.kind.to_data(),
            id: node.id,
        }
    }
}

/// Wire shape of an edge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEdge {
    id: EdgeId,
    source: NodeId,
    target: NodeId,
    #[serde(default)]
    source_handle: Option<String>,
    #[serde(default)]
    target_handle: Option<String>,
}

/// A data-flow dependency between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEdge", into = "RawEdge")]
pub struct GraphEdge {
    /// Unique identifier for this edge
    pub id: EdgeId,
    /// Source node ID
    pub source: NodeId,
    /// Source handle as sent by the editor
    pub source_handle: Option<String>,
    /// Target node ID
    pub target: NodeId,
    /// Target handle as sent by the editor
    pub target_handle: Option<String>,
    /// Parsed kind of the target handle
    pub target_kind: HandleKind,
}

impl GraphEdge {
    /// Create an edge, parsing the target handle
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        RawEdge {
            id: id.into(),
            source: source.into(),
            source_handle: Some(source_handle.into()),
            target: target.into(),
            target_handle: Some(target_handle.into()),
        }
        .into()
    }
}

impl From<RawEdge> for GraphEdge {
    fn from(raw: RawEdge) -> Self {
        let target_kind = HandleKind::from_optional(raw.target_handle.as_deref());
        Self {
            id: raw.id,
            source: raw.source,
            source_handle: raw.source_handle,
            target: raw.target,
            target_handle: raw.target_handle,
            target_kind,
        }
    }
}

impl From<GraphEdge> for RawEdge {
    fn from(edge: GraphEdge) -> Self {
        Self {
            id: edge.id,
            source: edge.source,
            target: edge.target,
            source_handle: edge.source_handle,
            target_handle: edge.target_handle,
        }
    }
}

/// An immutable graph snapshot handed to a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    /// Optional identifier of the saved workflow this snapshot came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Nodes in the graph
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// Edges connecting nodes
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    /// Create a graph from nodes and edges
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self {
            workflow_id: None,
            nodes,
            edges,
        }
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Get edges coming into a node, in edge-array order
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Restrict the graph to the given targets and everything upstream of them.
    ///
    /// Only edges whose endpoints both survive are kept. Nodes and edges keep
    /// their order from the full graph.
    pub fn upstream_subgraph(&self, targets: &[NodeId]) -> Result<WorkflowGraph, GraphError> {
        let mut keep: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        for target in targets {
            let node = self
                .find_node(target)
                .ok_or_else(|| GraphError::NodeNotFound(target.clone()))?;
            if keep.insert(node.id.as_str()) {
                queue.push_back(node.id.as_str());
            }
        }

        while let Some(current) = queue.pop_front() {
            for edge in self.incoming_edges(current) {
                // Edges from nodes outside the snapshot carry no dependency
                if self.find_node(&edge.source).is_none() {
                    continue;
                }
                if keep.insert(edge.source.as_str()) {
                    queue.push_back(edge.source.as_str());
                }
            }
        }

        Ok(WorkflowGraph {
            workflow_id: self.workflow_id.clone(),
            nodes: self
                .nodes
                .iter()
                .filter(|n| keep.contains(n.id.as_str()))
                .cloned()
                .collect(),
            edges: self
                .edges
                .iter()
                .filter(|e| keep.contains(e.source.as_str()) && keep.contains(e.target.as_str()))
                .cloned()
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Results and runs
// ---------------------------------------------------------------------------

/// Terminal status of one node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
}

/// The immutable outcome of one node's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: NodeId,
    pub output: Option<Value>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResult {
    /// A completed result
    pub fn completed(node_id: impl Into<String>, output: Value) -> Self {
        Self {
            node_id: node_id.into(),
            output: Some(output),
            status: NodeStatus::Completed,
            error: None,
        }
    }

    /// A failed result
    pub fn failed(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            output: None,
            status: NodeStatus::Failed,
            error: Some(error.into()),
        }
    }

    /// Whether the node completed
    pub fn is_completed(&self) -> bool {
        self.status == NodeStatus::Completed
    }
}

/// Which part of the graph a run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunScope {
    Full,
    Selected,
    Single,
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "Full",
            Self::Selected => "Selected",
            Self::Single => "Single",
        }
    }
}

impl FromStr for RunScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Full" => Ok(Self::Full),
            "Selected" => Ok(Self::Selected),
            "Single" => Ok(Self::Single),
            other => Err(format!("unknown run scope '{}'", other)),
        }
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}
