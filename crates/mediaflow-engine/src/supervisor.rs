//! Workflow supervisor.
//!
//! Drives one run of a graph snapshot: plans the phases, persists the run,
//! fans out every node of a phase concurrently, waits for the phase to settle,
//! and decides the run's terminal status.
//!
//! Node failures are recorded and the run continues; downstream nodes run with
//! whatever inputs remain. Only infrastructure failures (recorder writes, an
//! unreachable task runner) fail the run.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::analyzer::{execution_phases, Phases};
use crate::dispatcher::NodeDispatcher;
use crate::error::{EngineError, NodeError, Result};
use crate::events::{EventSink, NullEventSink, WorkflowEvent};
use crate::recorder::{NodeRecordUpdate, NodeRunStatus, RunId, RunRecorder};
use crate::router::resolve_inputs;
use crate::types::{NodeId, NodeResult, ResultTable, RunScope, RunStatus, WorkflowGraph};

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub scope: RunScope,
    pub status: RunStatus,
    pub phases: Phases,
    pub results: ResultTable,
    pub duration_ms: u64,
}

impl RunReport {
    /// Result of one node
    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.results.get(node_id)
    }

    /// Results of the nodes that failed, in phase order
    pub fn failed_nodes(&self) -> Vec<&NodeResult> {
        self.phases
            .iter()
            .flatten()
            .filter_map(|id| self.results.get(id))
            .filter(|r| !r.is_completed())
            .collect()
    }
}

/// A run executing in the background
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    pub scope: RunScope,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    /// Wait for the run to finish
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?
    }
}

/// Executes graph snapshots phase by phase
#[derive(Clone)]
pub struct WorkflowSupervisor {
    dispatcher: Arc<NodeDispatcher>,
    recorder: Arc<dyn RunRecorder>,
    event_sink: Arc<dyn EventSink>,
}

impl WorkflowSupervisor {
    /// Create a supervisor that discards events
    pub fn new(dispatcher: NodeDispatcher, recorder: Arc<dyn RunRecorder>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            recorder,
            event_sink: Arc::new(NullEventSink),
        }
    }

    /// Stream progress events to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Validate and start a full run.
    ///
    /// A cyclic graph fails here, before any run record exists. The phases
    /// then execute on a background task.
    pub async fn run_workflow(&self, graph: WorkflowGraph) -> Result<RunHandle> {
        self.start(graph, RunScope::Full).await
    }

    /// Start a run of `targets` and everything upstream of them
    pub async fn run_nodes(&self, graph: &WorkflowGraph, targets: &[NodeId]) -> Result<RunHandle> {
        let subgraph = graph.upstream_subgraph(targets)?;
        let scope = if subgraph.nodes.len() == 1 {
            RunScope::Single
        } else {
            RunScope::Selected
        };
        self.start(subgraph, scope).await
    }

    /// Run a graph to completion on the current task
    pub async fn execute(&self, graph: &WorkflowGraph, scope: RunScope) -> Result<RunReport> {
        let phases = execution_phases(graph)?;
        let run_id = self
            .recorder
            .create_run(graph.workflow_id.as_deref(), scope)
            .await?;
        self.execute_phases(&run_id, scope, graph, phases).await
    }

    async fn start(&self, graph: WorkflowGraph, scope: RunScope) -> Result<RunHandle> {
        let phases = execution_phases(&graph)?;
        let run_id = self
            .recorder
            .create_run(graph.workflow_id.as_deref(), scope)
            .await?;

        let supervisor = self.clone();
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            supervisor
                .execute_phases(&task_run_id, scope, &graph, phases)
                .await
        });

        Ok(RunHandle { run_id, scope, task })
    }

    async fn execute_phases(
        &self,
        run_id: &str,
        scope: RunScope,
        graph: &WorkflowGraph,
        phases: Phases,
    ) -> Result<RunReport> {
        let start_time = Instant::now();
        log::info!(
            "[{}] Starting {} run: {} nodes, {} edges, {} phases",
            run_id,
            scope.as_str(),
            graph.nodes.len(),
            graph.edges.len(),
            phases.len()
        );
        self.emit(WorkflowEvent::RunStarted {
            run_id: run_id.to_string(),
            scope,
            node_count: graph.nodes.len(),
            phase_count: phases.len(),
        });

        let mut results = ResultTable::new();
        let outcome = self.run_phases(run_id, graph, &phases, &mut results).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        if let Err(e) = outcome {
            log::error!("[{}] Run failed: {}", run_id, e);
            if let Err(finish_err) = self.recorder.finish_run(run_id, RunStatus::Failed).await {
                log::warn!("[{}] Could not mark run as failed: {}", run_id, finish_err);
            }
            self.emit(WorkflowEvent::RunFailed {
                run_id: run_id.to_string(),
                error: e.to_string(),
            });
            return Err(e);
        }

        if let Err(e) = self.recorder.finish_run(run_id, RunStatus::Completed).await {
            log::error!("[{}] Could not mark run as completed: {}", run_id, e);
            self.emit(WorkflowEvent::RunFailed {
                run_id: run_id.to_string(),
                error: e.to_string(),
            });
            return Err(e.into());
        }

        let report = RunReport {
            run_id: run_id.to_string(),
            scope,
            status: RunStatus::Completed,
            phases,
            results,
            duration_ms,
        };
        let failed_nodes = report.failed_nodes().len();
        log::info!(
            "[{}] Run completed in {}ms ({} failed node(s))",
            run_id,
            duration_ms,
            failed_nodes
        );
        self.emit(WorkflowEvent::RunCompleted {
            run_id: run_id.to_string(),
            failed_nodes,
            duration_ms,
        });
        Ok(report)
    }

    async fn run_phases(
        &self,
        run_id: &str,
        graph: &WorkflowGraph,
        phases: &Phases,
        results: &mut ResultTable,
    ) -> Result<()> {
        for (index, phase) in phases.iter().enumerate() {
            log::info!(
                "[{}] Phase {}/{}: {}",
                run_id,
                index + 1,
                phases.len(),
                phase.join(", ")
            );
            self.emit(WorkflowEvent::PhaseStarted {
                run_id: run_id.to_string(),
                phase: index,
                node_ids: phase.clone(),
            });

            self.mark_running(run_id, phase).await;

            let settled = {
                let snapshot: &ResultTable = results;
                join_all(
                    phase
                        .iter()
                        .map(|node_id| self.run_node(run_id, graph, node_id, snapshot)),
                )
                .await
            };

            let mut failed = 0usize;
            let mut infrastructure = None;
            for outcome in settled {
                match outcome {
                    Ok(result) => {
                        if !result.is_completed() {
                            failed += 1;
                        }
                        results.insert(result.node_id.clone(), result);
                    }
                    Err(e) => {
                        infrastructure.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = infrastructure {
                return Err(e);
            }

            if failed > 0 {
                log::warn!(
                    "[{}] Phase {}/{}: {} of {} node(s) failed",
                    run_id,
                    index + 1,
                    phases.len(),
                    failed,
                    phase.len()
                );
            }
            self.emit(WorkflowEvent::PhaseCompleted {
                run_id: run_id.to_string(),
                phase: index,
                failed,
            });
        }
        Ok(())
    }

    /// Insert "Running" stubs; failures here never affect the run
    async fn mark_running(&self, run_id: &str, phase: &[NodeId]) {
        let stubs = join_all(
            phase
                .iter()
                .map(|node_id| self.recorder.mark_node_running(run_id, node_id)),
        )
        .await;

        for (node_id, stub) in phase.iter().zip(stubs) {
            if let Err(e) = stub {
                log::warn!("[{}] Could not mark node '{}' running: {}", run_id, node_id, e);
                self.emit(WorkflowEvent::RecorderWarning {
                    run_id: run_id.to_string(),
                    node_id: Some(node_id.clone()),
                    message: e.to_string(),
                });
            }
        }
    }

    async fn run_node(
        &self,
        run_id: &str,
        graph: &WorkflowGraph,
        node_id: &str,
        results: &ResultTable,
    ) -> Result<NodeResult> {
        self.emit(WorkflowEvent::NodeStarted {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
        });

        let inputs = resolve_inputs(node_id, graph, results);
        let start_time = Instant::now();
        let outcome = self.dispatcher.dispatch(graph, node_id, &inputs).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        let mut update = NodeRecordUpdate {
            node_id: node_id.to_string(),
            status: NodeRunStatus::Success,
            inputs: inputs.to_value(),
            output: None,
            error: None,
            duration_ms,
        };

        let result = match outcome {
            Ok(output) => {
                update.output = Some(output.clone());
                NodeResult::completed(node_id, output)
            }
            Err(NodeError::Infrastructure(e)) => {
                log::error!("[{}] Node '{}': {}", run_id, node_id, e);
                update.status = NodeRunStatus::Failed;
                update.error = Some(e.to_string());
                if let Err(record_err) = self.recorder.record_node_result(run_id, update).await {
                    log::warn!("[{}] Could not record node '{}': {}", run_id, node_id, record_err);
                }
                self.emit_node_failed(run_id, node_id, &e.to_string(), duration_ms);
                return Err(e.into());
            }
            Err(e) => {
                log::warn!("[{}] Node '{}' failed: {}", run_id, node_id, e);
                update.status = NodeRunStatus::Failed;
                update.error = Some(e.to_string());
                NodeResult::failed(node_id, e.to_string())
            }
        };

        self.recorder.record_node_result(run_id, update).await?;

        match &result.output {
            Some(output) if result.is_completed() => {
                self.emit_node_completed(run_id, node_id, output, duration_ms)
            }
            _ => self.emit_node_failed(
                run_id,
                node_id,
                result.error.as_deref().unwrap_or_default(),
                duration_ms,
            ),
        }
        Ok(result)
    }

    // Event emission helpers

    fn emit(&self, event: WorkflowEvent) {
        let _ = self.event_sink.send(event);
    }

    fn emit_node_completed(&self, run_id: &str, node_id: &str, output: &Value, duration_ms: u64) {
        self.emit(WorkflowEvent::NodeCompleted {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            output: output.clone(),
            duration_ms,
        });
    }

    fn emit_node_failed(&self, run_id: &str, node_id: &str, error: &str, duration_ms: u64) {
        self.emit(WorkflowEvent::NodeFailed {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            error: error.to_string(),
            duration_ms,
        });
    }
}
