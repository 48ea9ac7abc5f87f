//! Fluent builder for workflow graphs
//!
//! Provides a typed, fluent API for constructing graph snapshots
//! programmatically (tests, tools, embedding hosts).

use serde_json::Value;

use crate::types::{
    CropConfig, ExtractFrameConfig, GraphEdge, GraphNode, LlmConfig, Measure, NodeKind,
    TextSourceConfig, UploadConfig, WorkflowGraph,
};

/// Fluent builder for constructing workflow graphs
///
/// # Example
///
/// ```
/// use mediaflow_engine::WorkflowBuilder;
///
/// let graph = WorkflowBuilder::new()
///     .image("photo", "https://cdn.example.com/p.jpg")
///     .crop("crop", 10, 10, 80, 80)
///     .connect("photo", "image:output", "crop", "image:input")
///     .build();
/// assert_eq!(graph.nodes.len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    workflow_id: Option<String>,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    edge_counter: usize,
}

impl WorkflowBuilder {
    /// Create a new workflow builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag the snapshot with the id of the saved workflow it came from
    pub fn workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    /// Add a node with an already-decoded kind
    pub fn add_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(GraphNode::new(id, kind));
        self
    }

    /// Add a static text node
    pub fn text(self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::TextSource(TextSourceConfig {
                text: Some(text.into()),
            }),
        )
    }

    /// Add an image upload node
    pub fn image(self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::ImageUpload(UploadConfig {
                url: Some(url.into()),
            }),
        )
    }

    /// Add a video upload node
    pub fn video(self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::VideoUpload(UploadConfig {
                url: Some(url.into()),
            }),
        )
    }

    /// Add a crop node with integer percentages
    pub fn crop(self, id: impl Into<String>, x: i64, y: i64, width: i64, height: i64) -> Self {
        self.add_node(
            id,
            NodeKind::Crop(CropConfig {
                image_url: None,
                x: Some(Measure::int(x)),
                y: Some(Measure::int(y)),
                width: Some(Measure::int(width)),
                height: Some(Measure::int(height)),
            }),
        )
    }

    /// Add a frame extraction node
    pub fn extract_frame(self, id: impl Into<String>, timestamp: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::ExtractFrame(ExtractFrameConfig {
                video_url: None,
                timestamp: Some(Measure::text(timestamp)),
            }),
        )
    }

    /// Add an LLM node with default configuration
    pub fn llm(self, id: impl Into<String>) -> Self {
        self.add_node(id, NodeKind::Llm(LlmConfig::default()))
    }

    /// Add an LLM node with an explicit configuration
    pub fn llm_with(self, id: impl Into<String>, config: LlmConfig) -> Self {
        self.add_node(id, NodeKind::Llm(config))
    }

    /// Add a node of a type the engine does not know
    pub fn unknown(self, id: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.add_node(
            id,
            NodeKind::Unknown {
                type_name: Some(type_name.into()),
                data: Value::Object(serde_json::Map::new()),
            },
        )
    }

    /// Connect two nodes (auto-generates the edge ID)
    pub fn connect(
        mut self,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        self.edge_counter += 1;
        self.edges.push(GraphEdge::new(
            format!("edge-{}", self.edge_counter),
            source,
            source_handle,
            target,
            target_handle,
        ));
        self
    }

    /// Build the graph without validation
    pub fn build(self) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new(self.nodes, self.edges);
        graph.workflow_id = self.workflow_id;
        graph
    }
}
