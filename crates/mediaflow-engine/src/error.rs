//! Error types for the workflow engine
//!
//! Errors are split by the boundary they cross. `GraphError` is raised before
//! a run starts, `NodeError` never leaves a single node's execution, and
//! `TaskRunnerError` / `RecorderError` describe the two external collaborators.
//! `EngineError` is what callers of the supervisor see.

use thiserror::Error;

use crate::types::NodeId;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Structural problems with a graph snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The graph is not a DAG
    #[error("Cycle detected in workflow ({} node(s) unreachable by topological order)", unvisited.len())]
    CycleDetected {
        /// Nodes that could not be placed in any phase
        unvisited: Vec<NodeId>,
    },

    /// Two nodes share an id
    #[error("Duplicate node id '{0}'")]
    DuplicateNodeId(NodeId),

    /// A referenced node id is not part of the graph
    #[error("Node '{0}' not found")]
    NodeNotFound(NodeId),

    /// A node's data bag does not match its declared type
    #[error("Invalid data for node '{node_id}' of type '{node_type}': {message}")]
    InvalidNodeData {
        node_id: NodeId,
        node_type: String,
        message: String,
    },
}

/// Failures of the task runner itself, as opposed to a unit that ran and failed
#[derive(Debug, Clone, Error)]
pub enum TaskRunnerError {
    /// The worker could not be reached at all
    #[error("Task runner unreachable: {0}")]
    Unreachable(String),

    /// The request was sent but the transport failed
    #[error("Task runner transport error: {0}")]
    Transport(String),

    /// The worker answered with something that is not a task outcome
    #[error("Invalid task runner response: {0}")]
    InvalidResponse(String),
}

/// Errors from the run recorder
#[derive(Debug, Clone, Error)]
pub enum RecorderError {
    /// A node record already exists for this run
    #[error("Node '{node_id}' already recorded for run '{run_id}'")]
    DuplicateNode { run_id: String, node_id: NodeId },

    /// The run does not exist
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// Underlying storage failed
    #[error("Recorder storage error: {0}")]
    Storage(String),
}

/// Per-node failures. These become a Failed node result and never abort a run,
/// with the exception of `Infrastructure`.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// The node id is not in the graph snapshot
    #[error("Node not found")]
    NotFound,

    /// The delegate payload failed schema validation
    #[error("Invalid {unit} payload: {reason}")]
    InvalidPayload { unit: String, reason: String },

    /// The delegate unit ran and failed after exhausting its retries
    #[error("{message}")]
    Delegate { unit: String, message: String },

    /// The task runner could not be reached at all
    #[error(transparent)]
    Infrastructure(TaskRunnerError),
}

impl NodeError {
    /// Classify a task runner error for the node that submitted to `unit`.
    ///
    /// Only an unreachable runner is an infrastructure failure. A timed out
    /// request or an undecodable answer fails the node like a unit failure.
    pub fn from_runner(unit: &str, err: TaskRunnerError) -> Self {
        match err {
            TaskRunnerError::Unreachable(_) => Self::Infrastructure(err),
            TaskRunnerError::Transport(_) | TaskRunnerError::InvalidResponse(_) => Self::Delegate {
                unit: unit.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Whether this failure should abort the whole run
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}

/// Errors that can occur in the workflow engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph could not be planned
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Run recorder failed
    #[error("Run recorder error: {0}")]
    Recorder(#[from] RecorderError),

    /// Task runner failed
    #[error("{0}")]
    TaskRunner(#[from] TaskRunnerError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The background run task panicked or was aborted
    #[error("Run task aborted: {0}")]
    Join(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error comes from an external collaborator rather than from
    /// the graph itself
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Recorder(_) | Self::TaskRunner(_) | Self::Join(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegate_message_is_verbatim() {
        let err = NodeError::Delegate {
            unit: "crop".to_string(),
            message: "ffmpeg exited with status 1".to_string(),
        };
        assert_eq!(err.to_string(), "ffmpeg exited with status 1");
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_infrastructure_classification() {
        let node_err = NodeError::from_runner("crop", TaskRunnerError::Unreachable("refused".into()));
        assert!(node_err.is_infrastructure());

        let timeout = NodeError::from_runner("crop", TaskRunnerError::Transport("operation timed out".into()));
        assert!(!timeout.is_infrastructure());
        assert_eq!(timeout.to_string(), "Task runner transport error: operation timed out");

        let garbled = NodeError::from_runner("llm-generate", TaskRunnerError::InvalidResponse("not json".into()));
        assert!(matches!(garbled, NodeError::Delegate { ref unit, .. } if unit == "llm-generate"));

        let engine_err: EngineError = RecorderError::Storage("disk full".into()).into();
        assert!(engine_err.is_infrastructure());

        let graph_err: EngineError = GraphError::CycleDetected { unvisited: vec!["a".into()] }.into();
        assert!(!graph_err.is_infrastructure());
    }
}
