//! Run recorder contract and an in-memory implementation
//!
//! The supervisor persists one run record per execution plus one record per
//! node. Durable backends live outside this crate (see `mediaflow-store`);
//! [`InMemoryRunRecorder`] serves tests and one-shot CLI runs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecorderError;
use crate::types::{NodeId, RunScope, RunStatus};

/// Identifier of a persisted run
pub type RunId = String;

/// Status of one node's record within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRunStatus {
    Running,
    Success,
    Failed,
}

impl NodeRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(Self::Running),
            "Success" => Ok(Self::Success),
            "Failed" => Ok(Self::Failed),
            other => Err(format!("unknown node run status '{}'", other)),
        }
    }
}

/// Terminal outcome of one node, as written by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecordUpdate {
    pub node_id: NodeId,
    pub status: NodeRunStatus,
    /// Snapshot of the routed inputs
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A persisted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub scope: RunScope,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A persisted node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunRecord {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub status: NodeRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRunRecord {
    /// A fresh "Running" record
    pub fn running(run_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            status: NodeRunStatus::Running,
            inputs: None,
            output: None,
            error: None,
            duration_ms: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Overwrite this record with a terminal outcome
    pub fn apply(&mut self, update: NodeRecordUpdate) {
        self.status = update.status;
        self.inputs = Some(update.inputs);
        self.output = update.output;
        self.error = update.error;
        self.duration_ms = Some(update.duration_ms);
        self.finished_at = Some(Utc::now());
    }
}

/// A run together with its node records, in insertion order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub nodes: Vec<NodeRunRecord>,
}

impl RunSnapshot {
    /// Find the record of one node
    pub fn node(&self, node_id: &str) -> Option<&NodeRunRecord> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Persists run and per-node outcomes.
///
/// Writes for distinct node ids of the same run may arrive concurrently.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    /// Create a run in the `Running` status
    async fn create_run(&self, workflow_id: Option<&str>, scope: RunScope) -> Result<RunId, RecorderError>;

    /// Insert a `Running` stub for a node. A second stub for the same node is
    /// a [`RecorderError::DuplicateNode`].
    async fn mark_node_running(&self, run_id: &str, node_id: &str) -> Result<(), RecorderError>;

    /// Write a node's terminal outcome, creating the record if no stub exists
    async fn record_node_result(&self, run_id: &str, update: NodeRecordUpdate) -> Result<(), RecorderError>;

    /// Move the run to its terminal status
    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), RecorderError>;

    /// Read a run and its node records
    async fn run_snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>, RecorderError>;
}

/// Process-local recorder
#[derive(Debug, Default)]
pub struct InMemoryRunRecorder {
    runs: Mutex<HashMap<RunId, RunSnapshot>>,
}

impl InMemoryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs recorded so far
    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }
}

#[async_trait]
impl RunRecorder for InMemoryRunRecorder {
    async fn create_run(&self, workflow_id: Option<&str>, scope: RunScope) -> Result<RunId, RecorderError> {
        let id = uuid::Uuid::new_v4().to_string();
        let run = RunRecord {
            id: id.clone(),
            workflow_id: workflow_id.map(str::to_string),
            scope,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        };
        self.runs.lock().insert(
            id.clone(),
            RunSnapshot {
                run,
                nodes: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn mark_node_running(&self, run_id: &str, node_id: &str) -> Result<(), RecorderError> {
        let mut runs = self.runs.lock();
        let snapshot = runs
            .get_mut(run_id)
            .ok_or_else(|| RecorderError::RunNotFound(run_id.to_string()))?;
        if snapshot.node(node_id).is_some() {
            return Err(RecorderError::DuplicateNode {
                run_id: run_id.to_string(),
                node_id: node_id.to_string(),
            });
        }
        snapshot.nodes.push(NodeRunRecord::running(run_id, node_id));
        Ok(())
    }

    async fn record_node_result(&self, run_id: &str, update: NodeRecordUpdate) -> Result<(), RecorderError> {
        let mut runs = self.runs.lock();
        let snapshot = runs
            .get_mut(run_id)
            .ok_or_else(|| RecorderError::RunNotFound(run_id.to_string()))?;

        match snapshot.nodes.iter_mut().find(|n| n.node_id == update.node_id) {
            Some(record) => record.apply(update),
            None => {
                let mut record = NodeRunRecord::running(run_id, update.node_id.clone());
                record.apply(update);
                snapshot.nodes.push(record);
            }
        }
        Ok(())
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), RecorderError> {
        let mut runs = self.runs.lock();
        let snapshot = runs
            .get_mut(run_id)
            .ok_or_else(|| RecorderError::RunNotFound(run_id.to_string()))?;

        let finished_at = Utc::now();
        let elapsed = (finished_at - snapshot.run.started_at).num_milliseconds().max(0) as u64;
        snapshot.run.status = status;
        snapshot.run.finished_at = Some(finished_at);
        snapshot.run.duration_ms = Some(elapsed);
        Ok(())
    }

    async fn run_snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>, RecorderError> {
        Ok(self.runs.lock().get(run_id).cloned())
    }
}
