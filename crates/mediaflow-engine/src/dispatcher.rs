//! Node dispatcher with built-in handlers for every node variant.
//!
//! Source nodes (text, uploads) and unknown types are computed in-process.
//! Crop, frame extraction and LLM nodes build a typed request, validate it and
//! submit it to the [`TaskRunner`]. The delegate's output is returned verbatim.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::delegate::{CropRequest, DelegateRequest, ExtractFrameRequest, LlmRequest};
use crate::error::NodeError;
use crate::router::NodeInputs;
use crate::task_runner::{TaskOutcome, TaskRunner};
use crate::types::{GraphNode, Measure, NodeKind, WorkflowGraph};

/// Values used when a node leaves a setting empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeDefaults {
    /// Model for LLM nodes without one
    pub default_model: String,
    /// User message for LLM nodes with neither an input nor a prompt
    pub default_prompt: String,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            default_model: "gemini-2.0-flash".to_string(),
            default_prompt: "Describe this image".to_string(),
        }
    }
}

/// First non-empty string of the candidates
fn non_empty<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<&'a str> {
    candidates.into_iter().flatten().find(|s| !s.is_empty())
}

/// A configured measure, or `fallback` when absent or blank
fn measure_or(measure: Option<&Measure>, fallback: &str) -> Measure {
    match measure {
        Some(m) if !m.is_blank() => m.clone(),
        _ => Measure::text(fallback),
    }
}

/// Executes single nodes, delegating heavy work to a task runner
pub struct NodeDispatcher {
    runner: Arc<dyn TaskRunner>,
    defaults: NodeDefaults,
}

impl NodeDispatcher {
    /// Create a dispatcher with default node settings
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            defaults: NodeDefaults::default(),
        }
    }

    /// Override the node defaults
    pub fn with_defaults(mut self, defaults: NodeDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build the delegate request for a node, or `None` for in-process variants
    pub fn build_request(&self, node: &GraphNode, inputs: &NodeInputs) -> Option<DelegateRequest> {
        match &node.kind {
            NodeKind::Crop(config) => Some(DelegateRequest::Crop(CropRequest {
                image_url: non_empty([inputs.image_url.as_deref(), config.image_url.as_deref()])
                    .unwrap_or_default()
                    .to_string(),
                x: measure_or(config.x.as_ref(), "0%"),
                y: measure_or(config.y.as_ref(), "0%"),
                width: measure_or(config.width.as_ref(), "100%"),
                height: measure_or(config.height.as_ref(), "100%"),
            })),
            NodeKind::ExtractFrame(config) => Some(DelegateRequest::ExtractFrame(ExtractFrameRequest {
                video_url: non_empty([inputs.video_url.as_deref(), config.video_url.as_deref()])
                    .unwrap_or_default()
                    .to_string(),
                timestamp: measure_or(config.timestamp.as_ref(), "0"),
            })),
            NodeKind::Llm(config) => Some(DelegateRequest::Llm(LlmRequest {
                system_prompt: inputs.system_prompt.clone().unwrap_or_default(),
                user_message: non_empty([
                    inputs.user_message.as_deref(),
                    config.prompt.as_deref(),
                    Some(self.defaults.default_prompt.as_str()),
                ])
                .unwrap_or_default()
                .to_string(),
                image_urls: inputs.image_urls.clone(),
                model: non_empty([config.model.as_deref(), Some(self.defaults.default_model.as_str())])
                    .unwrap_or_default()
                    .to_string(),
            })),
            NodeKind::TextSource(_)
            | NodeKind::ImageUpload(_)
            | NodeKind::VideoUpload(_)
            | NodeKind::Unknown { .. } => None,
        }
    }

    /// Execute one node with its routed inputs
    pub async fn execute(&self, node: &GraphNode, inputs: &NodeInputs) -> Result<Value, NodeError> {
        log::debug!(
            "NodeDispatcher: executing '{}' (type '{}')",
            node.id,
            node.kind.type_name().unwrap_or("<none>")
        );

        match &node.kind {
            NodeKind::ImageUpload(config) | NodeKind::VideoUpload(config) => {
                Ok(json!({ "url": non_empty([config.url.as_deref()]) }))
            }
            NodeKind::TextSource(config) => Ok(json!({ "text": config.text.as_deref().unwrap_or("") })),
            NodeKind::Unknown { type_name, .. } => {
                log::warn!(
                    "Node '{}' has unknown type '{}', passing through",
                    node.id,
                    type_name.as_deref().unwrap_or("<none>")
                );
                Ok(json!({ "passthrough": true }))
            }
            NodeKind::Crop(_) | NodeKind::ExtractFrame(_) | NodeKind::Llm(_) => {
                let request = self.build_request(node, inputs).ok_or_else(|| NodeError::InvalidPayload {
                    unit: node.kind.type_name().unwrap_or("<none>").to_string(),
                    reason: "no delegate request for this node type".to_string(),
                })?;
                self.submit(&request).await
            }
        }
    }

    /// Look a node up in the snapshot and execute it
    pub async fn dispatch(
        &self,
        graph: &WorkflowGraph,
        node_id: &str,
        inputs: &NodeInputs,
    ) -> Result<Value, NodeError> {
        let node = graph.find_node(node_id).ok_or(NodeError::NotFound)?;
        self.execute(node, inputs).await
    }

    async fn submit(&self, request: &DelegateRequest) -> Result<Value, NodeError> {
        let payload = request.to_payload()?;
        let unit = request.unit();

        let outcome = self
            .runner
            .submit(unit, payload)
            .await
            .map_err(|e| NodeError::from_runner(unit, e))?;

        match outcome {
            TaskOutcome::Completed(output) => Ok(output),
            TaskOutcome::Failed(message) => Err(NodeError::Delegate {
                unit: unit.to_string(),
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::error::TaskRunnerError;
    use crate::router::resolve_inputs;
    use crate::types::{LlmConfig, NodeResult, ResultTable};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records submissions and answers with a canned outcome
    struct MockRunner {
        outcome: Result<TaskOutcome, TaskRunnerError>,
        submitted: Mutex<Vec<(String, Value)>>,
    }

    impl MockRunner {
        fn answering(outcome: Result<TaskOutcome, TaskRunnerError>) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                submitted: Mutex::new(Vec::new()),
            })
        }

        fn submitted(&self) -> Vec<(String, Value)> {
            self.submitted.lock().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for MockRunner {
        async fn submit(&self, unit: &str, payload: Value) -> Result<TaskOutcome, TaskRunnerError> {
            self.submitted.lock().push((unit.to_string(), payload));
            self.outcome.clone()
        }
    }

    fn table(entries: Vec<NodeResult>) -> ResultTable {
        entries.into_iter().map(|r| (r.node_id.clone(), r)).collect()
    }

    #[tokio::test]
    async fn test_text_to_llm_payload() {
        let runner = MockRunner::answering(Ok(TaskOutcome::Completed(
            json!({"response": "Hi!", "model": "gemini-2.0-flash"}),
        )));
        let dispatcher = NodeDispatcher::new(runner.clone());

        let graph = WorkflowBuilder::new()
            .text("a", "hello")
            .llm("b")
            .connect("a", "text:output", "b", "text:user")
            .build();
        let results = table(vec![NodeResult::completed("a", json!({"text": "hello"}))]);
        let inputs = resolve_inputs("b", &graph, &results);

        let output = dispatcher.dispatch(&graph, "b", &inputs).await.unwrap();
        assert_eq!(output, json!({"response": "Hi!", "model": "gemini-2.0-flash"}));

        let submitted = runner.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, "llm-generate");
        assert_eq!(
            submitted[0].1,
            json!({
                "systemPrompt": "",
                "userMessage": "hello",
                "imageUrls": [],
                "model": "gemini-2.0-flash"
            })
        );
    }

    #[tokio::test]
    async fn test_image_to_crop_payload() {
        let runner = MockRunner::answering(Ok(TaskOutcome::Completed(json!({"url": "http://x/c.jpg"}))));
        let dispatcher = NodeDispatcher::new(runner.clone());

        let graph = WorkflowBuilder::new()
            .image("a", "http://x/i.jpg")
            .crop("b", 10, 10, 80, 80)
            .connect("a", "image:output", "b", "image:input")
            .build();
        let results = table(vec![NodeResult::completed("a", json!({"url": "http://x/i.jpg"}))]);
        let inputs = resolve_inputs("b", &graph, &results);

        let output = dispatcher.dispatch(&graph, "b", &inputs).await.unwrap();
        assert_eq!(output, json!({"url": "http://x/c.jpg"}));
        assert_eq!(
            runner.submitted()[0],
            (
                "crop".to_string(),
                json!({"imageUrl": "http://x/i.jpg", "x": 10, "y": 10, "width": 80, "height": 80})
            )
        );
    }

    #[tokio::test]
    async fn test_source_nodes_run_in_process() {
        let runner = MockRunner::answering(Ok(TaskOutcome::Completed(Value::Null)));
        let dispatcher = NodeDispatcher::new(runner.clone());
        let graph = WorkflowBuilder::new()
            .text("t", "hello")
            .image("i", "http://x/i.jpg")
            .video("v", "")
            .unknown("u", "stickyNote")
            .build();
        let none = NodeInputs::default();

        assert_eq!(dispatcher.dispatch(&graph, "t", &none).await.unwrap(), json!({"text": "hello"}));
        assert_eq!(dispatcher.dispatch(&graph, "i", &none).await.unwrap(), json!({"url": "http://x/i.jpg"}));
        assert_eq!(dispatcher.dispatch(&graph, "v", &none).await.unwrap(), json!({"url": null}));
        assert_eq!(dispatcher.dispatch(&graph, "u", &none).await.unwrap(), json!({"passthrough": true}));
        assert!(runner.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_defaults_and_fallbacks() {
        let runner = MockRunner::answering(Ok(TaskOutcome::Completed(Value::Null)));
        let dispatcher = NodeDispatcher::new(runner);
        let graph = WorkflowBuilder::new()
            .llm_with(
                "l",
                LlmConfig {
                    prompt: Some(String::new()),
                    model: None,
                },
            )
            .extract_frame("f", "")
            .build();
        let none = NodeInputs::default();

        match dispatcher.build_request(&graph.nodes[0], &none) {
            Some(DelegateRequest::Llm(req)) => {
                assert_eq!(req.user_message, "Describe this image");
                assert_eq!(req.model, "gemini-2.0-flash");
            }
            other => panic!("Expected Llm request, got {:?}", other),
        }
        match dispatcher.build_request(&graph.nodes[1], &none) {
            Some(DelegateRequest::ExtractFrame(req)) => assert_eq!(req.timestamp, Measure::text("0")),
            other => panic!("Expected ExtractFrame request, got {:?}", other),
        }
    }

    #[test]
    fn test_only_delegate_variants_build_requests() {
        let dispatcher = NodeDispatcher::new(MockRunner::answering(Ok(TaskOutcome::Completed(Value::Null))));
        let graph = WorkflowBuilder::new()
            .crop("crop", 10, 10, 80, 80)
            .extract_frame("frame", "5")
            .llm("llm")
            .text("text", "hi")
            .image("image", "http://x/i.jpg")
            .video("video", "http://x/v.mp4")
            .unknown("note", "stickyNote")
            .build();
        let none = NodeInputs::default();

        let units: Vec<Option<&str>> = graph
            .nodes
            .iter()
            .map(|node| dispatcher.build_request(node, &none).map(|r| r.unit()))
            .collect();
        assert_eq!(
            units,
            vec![Some("crop"), Some("extract-frame"), Some("llm-generate"), None, None, None, None]
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_submitted() {
        let runner = MockRunner::answering(Ok(TaskOutcome::Completed(Value::Null)));
        let dispatcher = NodeDispatcher::new(runner.clone());
        let graph = WorkflowBuilder::new().crop("c", 0, 0, 100, 100).build();

        let err = dispatcher
            .dispatch(&graph, "c", &NodeInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidPayload { ref unit, .. } if unit == "crop"));
        assert!(runner.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_delegate_failure_and_unreachable() {
        let graph = WorkflowBuilder::new().llm("l").build();
        let none = NodeInputs::default();

        let failing = NodeDispatcher::new(MockRunner::answering(Ok(TaskOutcome::Failed("quota exceeded".into()))));
        let err = failing.dispatch(&graph, "l", &none).await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
        assert!(!err.is_infrastructure());

        let down = NodeDispatcher::new(MockRunner::answering(Err(TaskRunnerError::Unreachable("refused".into()))));
        let err = down.dispatch(&graph, "l", &none).await.unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_missing_node() {
        let dispatcher = NodeDispatcher::new(MockRunner::answering(Ok(TaskOutcome::Completed(Value::Null))));
        let err = dispatcher
            .dispatch(&WorkflowGraph::default(), "ghost", &NodeInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NotFound));
    }
}
