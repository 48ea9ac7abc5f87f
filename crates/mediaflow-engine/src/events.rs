//! Event types for streaming run progress
//!
//! Events are sent from the supervisor to any consumer (CLI, UI bridge, tests)
//! to report phase and node progress, failures, and run completion.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{NodeId, RunScope};

/// Trait for sending workflow events
///
/// This abstracts over the transport mechanism (mpsc channel, websocket
/// bridge, etc.) allowing the engine to be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// The run record exists and phases are planned
    #[serde(rename_all = "camelCase")]
    RunStarted {
        run_id: String,
        scope: RunScope,
        node_count: usize,
        phase_count: usize,
    },

    /// A phase is about to fan out
    #[serde(rename_all = "camelCase")]
    PhaseStarted {
        run_id: String,
        phase: usize,
        node_ids: Vec<NodeId>,
    },

    /// A node started executing
    #[serde(rename_all = "camelCase")]
    NodeStarted { run_id: String, node_id: NodeId },

    /// A node completed successfully
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        run_id: String,
        node_id: NodeId,
        output: Value,
        duration_ms: u64,
    },

    /// A node failed; the run continues
    #[serde(rename_all = "camelCase")]
    NodeFailed {
        run_id: String,
        node_id: NodeId,
        error: String,
        duration_ms: u64,
    },

    /// Every node of a phase has settled
    #[serde(rename_all = "camelCase")]
    PhaseCompleted {
        run_id: String,
        phase: usize,
        failed: usize,
    },

    /// The run reached `Completed`
    #[serde(rename_all = "camelCase")]
    RunCompleted {
        run_id: String,
        failed_nodes: usize,
        duration_ms: u64,
    },

    /// The run reached `Failed`
    #[serde(rename_all = "camelCase")]
    RunFailed { run_id: String, error: String },

    /// A best-effort recorder write failed and was ignored
    #[serde(rename_all = "camelCase")]
    RecorderWarning {
        run_id: String,
        node_id: Option<NodeId>,
        message: String,
    },
}

impl WorkflowEvent {
    /// Run id carried by every event
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PhaseStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::PhaseCompleted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RecorderWarning { run_id, .. } => run_id,
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel
#[derive(Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}
