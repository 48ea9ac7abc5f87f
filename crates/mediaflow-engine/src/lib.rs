//! Mediaflow Engine - phase-parallel execution of media and LLM workflows
//!
//! A workflow is a DAG of typed nodes (text, image/video uploads, crop,
//! frame extraction, LLM). This crate validates a graph snapshot, groups it
//! into phases, and runs every node of a phase concurrently:
//!
//! - `analyzer`: cycle detection and level-grouped topological phases
//! - `router`: maps upstream outputs into a node's typed inputs by handle kind
//! - `dispatcher`: computes source nodes in-process, delegates the rest
//! - `task_runner`: the delegate contract, with bounded retry and an HTTP runner
//! - `recorder`: the run/node persistence contract
//! - `supervisor`: drives a run and decides its status
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mediaflow_engine::{EngineConfig, InMemoryRunRecorder, WorkflowBuilder, WorkflowSupervisor};
//!
//! let config = EngineConfig::default();
//! let supervisor = WorkflowSupervisor::new(
//!     config.http_dispatcher()?,
//!     Arc::new(InMemoryRunRecorder::new()),
//! );
//!
//! let graph = WorkflowBuilder::new()
//!     .image("photo", "https://cdn.example.com/p.jpg")
//!     .llm("caption")
//!     .connect("photo", "image:output", "caption", "image:input")
//!     .build();
//!
//! let report = supervisor.run_workflow(graph).await?.wait().await?;
//! ```

pub mod analyzer;
pub mod builder;
pub mod config;
pub mod delegate;
pub mod dispatcher;
pub mod error;
pub mod events;
#[cfg(feature = "http-runner")]
pub mod http_runner;
pub mod recorder;
pub mod router;
pub mod supervisor;
pub mod task_runner;
pub mod types;

// Re-export key types
pub use analyzer::{execution_phases, topological_order, validate_dag, DependencyGraph, Phases};
pub use builder::WorkflowBuilder;
pub use config::{EngineConfig, WorkerConfig};
pub use delegate::{DelegateRequest, CROP_UNIT, EXTRACT_FRAME_UNIT, LLM_UNIT};
pub use dispatcher::{NodeDefaults, NodeDispatcher};
pub use error::{EngineError, GraphError, NodeError, RecorderError, Result, TaskRunnerError};
pub use events::{ChannelEventSink, EventSink, NullEventSink, VecEventSink, WorkflowEvent};
#[cfg(feature = "http-runner")]
pub use http_runner::HttpTaskRunner;
pub use recorder::{
    InMemoryRunRecorder, NodeRecordUpdate, NodeRunRecord, NodeRunStatus, RunId, RunRecord,
    RunRecorder, RunSnapshot,
};
pub use router::{resolve_inputs, NodeInputs};
pub use supervisor::{RunHandle, RunReport, WorkflowSupervisor};
pub use task_runner::{RetryPolicy, RetryingTaskRunner, TaskOutcome, TaskRunner};
pub use types::{
    GraphEdge, GraphNode, HandleKind, Measure, NodeId, NodeKind, NodeResult, NodeStatus,
    ResultTable, RunScope, RunStatus, WorkflowGraph,
};
