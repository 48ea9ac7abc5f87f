//! SQLite-backed run recorder
//!
//! Runs live in `run_history`, node records in `node_run` with one row per
//! `(run_id, node_id)`. All statements run on the blocking pool behind a single
//! connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;

use mediaflow_engine::recorder::{
    NodeRecordUpdate, NodeRunRecord, NodeRunStatus, RunId, RunRecord, RunRecorder, RunSnapshot,
};
use mediaflow_engine::{RecorderError, RunScope, RunStatus};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS run_history (
        id TEXT PRIMARY KEY,
        workflow_id TEXT,
        scope TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        duration_ms INTEGER
    );

    CREATE TABLE IF NOT EXISTS node_run (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES run_history(id) ON DELETE CASCADE,
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        inputs TEXT,
        output TEXT,
        error TEXT,
        duration_ms INTEGER,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        UNIQUE(run_id, node_id)
    );

    CREATE INDEX IF NOT EXISTS idx_node_run_run ON node_run(run_id);";

/// Errors local to the SQLite store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl From<StoreError> for RecorderError {
    fn from(e: StoreError) -> Self {
        RecorderError::Storage(e.to_string())
    }
}

/// Run recorder persisted in a SQLite database
#[derive(Clone)]
pub struct SqliteRunRecorder {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunRecorder {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        log::info!("Opened run database at {:?}", path);
        Self::init(conn)
    }

    /// A throwaway database that lives as long as the recorder
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, RecorderError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RecorderError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| RecorderError::from(StoreError::Join(e.to_string())))?
    }
}

fn storage(e: rusqlite::Error) -> RecorderError {
    StoreError::Sqlite(e).into()
}

fn corrupt(what: impl Into<String>) -> RecorderError {
    StoreError::Corrupt(what.into()).into()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, RecorderError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>, RecorderError> {
    raw.map(|text| serde_json::from_str(&text).map_err(|e| corrupt(format!("json column: {}", e))))
        .transpose()
}

fn run_exists(conn: &Connection, run_id: &str) -> Result<bool, RecorderError> {
    conn.query_row("SELECT 1 FROM run_history WHERE id = ?1", params![run_id], |_| Ok(()))
        .optional()
        .map(|row| row.is_some())
        .map_err(storage)
}

/// Columns of a `run_history` row before decoding
struct RunRow {
    id: String,
    workflow_id: Option<String>,
    scope: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
}

impl RunRow {
    fn decode(self) -> Result<RunRecord, RecorderError> {
        Ok(RunRecord {
            scope: self.scope.parse::<RunScope>().map_err(corrupt)?,
            status: self.status.parse::<RunStatus>().map_err(corrupt)?,
            started_at: parse_time(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            duration_ms: self.duration_ms.map(|ms| ms.max(0) as u64),
            workflow_id: self.workflow_id,
            id: self.id,
        })
    }
}

/// Columns of a `node_run` row before decoding
struct NodeRow {
    run_id: String,
    node_id: String,
    status: String,
    inputs: Option<String>,
    output: Option<String>,
    error: Option<String>,
    duration_ms: Option<i64>,
    started_at: String,
    finished_at: Option<String>,
}

impl NodeRow {
    fn decode(self) -> Result<NodeRunRecord, RecorderError> {
        Ok(NodeRunRecord {
            status: self.status.parse::<NodeRunStatus>().map_err(corrupt)?,
            inputs: parse_json(self.inputs)?,
            output: parse_json(self.output)?,
            duration_ms: self.duration_ms.map(|ms| ms.max(0) as u64),
            started_at: parse_time(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            error: self.error,
            node_id: self.node_id,
            run_id: self.run_id,
        })
    }
}

#[async_trait]
impl RunRecorder for SqliteRunRecorder {
    async fn create_run(&self, workflow_id: Option<&str>, scope: RunScope) -> Result<RunId, RecorderError> {
        let id = uuid::Uuid::new_v4().to_string();
        let workflow_id = workflow_id.map(str::to_string);
        let run_id = id.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO run_history (id, workflow_id, scope, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id,
                    workflow_id,
                    scope.as_str(),
                    RunStatus::Running.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await?;

        Ok(id)
    }

    async fn mark_node_running(&self, run_id: &str, node_id: &str) -> Result<(), RecorderError> {
        let run_id = run_id.to_string();
        let node_id = node_id.to_string();

        self.with_conn(move |conn| {
            if !run_exists(conn, &run_id)? {
                return Err(RecorderError::RunNotFound(run_id));
            }
            let inserted = conn.execute(
                "INSERT INTO node_run (run_id, node_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id,
                    node_id,
                    NodeRunStatus::Running.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    Err(RecorderError::DuplicateNode { run_id, node_id })
                }
                Err(e) => Err(storage(e)),
            }
        })
        .await
    }

    async fn record_node_result(&self, run_id: &str, update: NodeRecordUpdate) -> Result<(), RecorderError> {
        let run_id = run_id.to_string();
        let inputs = update.inputs.to_string();
        let output = update.output.as_ref().map(|v| v.to_string());

        self.with_conn(move |conn| {
            if !run_exists(conn, &run_id)? {
                return Err(RecorderError::RunNotFound(run_id));
            }
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO node_run
                     (run_id, node_id, status, inputs, output, error, duration_ms, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(run_id, node_id) DO UPDATE SET
                     status = excluded.status,
                     inputs = excluded.inputs,
                     output = excluded.output,
                     error = excluded.error,
                     duration_ms = excluded.duration_ms,
                     finished_at = excluded.finished_at",
                params![
                    run_id,
                    update.node_id,
                    update.status.as_str(),
                    inputs,
                    output,
                    update.error,
                    update.duration_ms as i64,
                    now,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), RecorderError> {
        let run_id = run_id.to_string();

        self.with_conn(move |conn| {
            let started_at: Option<String> = conn
                .query_row(
                    "SELECT started_at FROM run_history WHERE id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;
            let Some(started_at) = started_at else {
                return Err(RecorderError::RunNotFound(run_id));
            };

            let finished_at = Utc::now();
            let duration_ms = (finished_at - parse_time(&started_at)?).num_milliseconds().max(0);
            conn.execute(
                "UPDATE run_history SET status = ?2, finished_at = ?3, duration_ms = ?4 WHERE id = ?1",
                params![run_id, status.as_str(), finished_at.to_rfc3339(), duration_ms],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await
    }

    async fn run_snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>, RecorderError> {
        let run_id = run_id.to_string();

        self.with_conn(move |conn| {
            let run = conn
                .query_row(
                    "SELECT id, workflow_id, scope, status, started_at, finished_at, duration_ms
                     FROM run_history WHERE id = ?1",
                    params![run_id],
                    |row| {
                        Ok(RunRow {
                            id: row.get(0)?,
                            workflow_id: row.get(1)?,
                            scope: row.get(2)?,
                            status: row.get(3)?,
                            started_at: row.get(4)?,
                            finished_at: row.get(5)?,
                            duration_ms: row.get(6)?,
                        })
                    },
                )
                .optional()
                .map_err(storage)?;
            let Some(run) = run else {
                return Ok(None);
            };

            let mut stmt = conn
                .prepare(
                    "SELECT run_id, node_id, status, inputs, output, error, duration_ms, started_at, finished_at
                     FROM node_run WHERE run_id = ?1 ORDER BY id",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok(NodeRow {
                        run_id: row.get(0)?,
                        node_id: row.get(1)?,
                        status: row.get(2)?,
                        inputs: row.get(3)?,
                        output: row.get(4)?,
                        error: row.get(5)?,
                        duration_ms: row.get(6)?,
                        started_at: row.get(7)?,
                        finished_at: row.get(8)?,
                    })
                })
                .map_err(storage)?;

            let mut nodes = Vec::new();
            for row in rows {
                nodes.push(row.map_err(storage)?.decode()?);
            }

            Ok(Some(RunSnapshot {
                run: run.decode()?,
                nodes,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_engine::task_runner::{TaskOutcome, TaskRunner};
    use mediaflow_engine::{NodeDispatcher, TaskRunnerError, WorkflowBuilder, WorkflowSupervisor};
    use serde_json::{json, Value};

    fn update(node_id: &str, status: NodeRunStatus, output: Option<Value>, error: Option<&str>) -> NodeRecordUpdate {
        NodeRecordUpdate {
            node_id: node_id.to_string(),
            status,
            inputs: json!({"imageUrls": []}),
            output,
            error: error.map(str::to_string),
            duration_ms: 42,
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let recorder = SqliteRunRecorder::in_memory().unwrap();
        let run_id = recorder.create_run(Some("wf-1"), RunScope::Selected).await.unwrap();

        recorder.mark_node_running(&run_id, "crop").await.unwrap();
        recorder
            .record_node_result(
                &run_id,
                update("crop", NodeRunStatus::Success, Some(json!({"url": "http://x/c.jpg"})), None),
            )
            .await
            .unwrap();
        recorder
            .record_node_result(&run_id, update("llm", NodeRunStatus::Failed, None, Some("quota exceeded")))
            .await
            .unwrap();
        recorder.finish_run(&run_id, RunStatus::Completed).await.unwrap();

        let snapshot = recorder.run_snapshot(&run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.run.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(snapshot.run.scope, RunScope::Selected);
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert!(snapshot.run.finished_at.is_some());
        assert!(snapshot.run.duration_ms.is_some());

        assert_eq!(snapshot.nodes.len(), 2);
        let crop = snapshot.node("crop").unwrap();
        assert_eq!(crop.status, NodeRunStatus::Success);
        assert_eq!(crop.output, Some(json!({"url": "http://x/c.jpg"})));
        assert_eq!(crop.inputs, Some(json!({"imageUrls": []})));
        assert_eq!(crop.duration_ms, Some(42));

        let llm = snapshot.node("llm").unwrap();
        assert_eq!(llm.status, NodeRunStatus::Failed);
        assert_eq!(llm.error.as_deref(), Some("quota exceeded"));
        assert!(llm.output.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_stub() {
        let recorder = SqliteRunRecorder::in_memory().unwrap();
        let run_id = recorder.create_run(None, RunScope::Full).await.unwrap();

        recorder.mark_node_running(&run_id, "a").await.unwrap();
        let err = recorder.mark_node_running(&run_id, "a").await.unwrap_err();
        assert!(matches!(err, RecorderError::DuplicateNode { ref node_id, .. } if node_id == "a"));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let recorder = SqliteRunRecorder::in_memory().unwrap();
        assert!(recorder.run_snapshot("missing").await.unwrap().is_none());
        assert!(matches!(
            recorder.mark_node_running("missing", "a").await,
            Err(RecorderError::RunNotFound(_))
        ));
        assert!(matches!(
            recorder.finish_run("missing", RunStatus::Failed).await,
            Err(RecorderError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");

        let run_id = {
            let recorder = SqliteRunRecorder::open(&path).unwrap();
            let run_id = recorder.create_run(None, RunScope::Single).await.unwrap();
            recorder
                .record_node_result(&run_id, update("t", NodeRunStatus::Success, Some(json!({"text": "hi"})), None))
                .await
                .unwrap();
            recorder.finish_run(&run_id, RunStatus::Failed).await.unwrap();
            run_id
        };

        let reopened = SqliteRunRecorder::open(&path).unwrap();
        let snapshot = reopened.run_snapshot(&run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Failed);
        assert_eq!(snapshot.node("t").unwrap().output, Some(json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn test_concurrent_node_writes() {
        let recorder = SqliteRunRecorder::in_memory().unwrap();
        let run_id = recorder.create_run(None, RunScope::Full).await.unwrap();

        let writes = (0..8).map(|i| {
            let recorder = recorder.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                let node_id = format!("n{}", i);
                recorder.mark_node_running(&run_id, &node_id).await?;
                recorder
                    .record_node_result(&run_id, update(&node_id, NodeRunStatus::Success, Some(json!(i)), None))
                    .await
            })
        });
        for handle in writes.collect::<Vec<_>>() {
            handle.await.unwrap().unwrap();
        }

        let snapshot = recorder.run_snapshot(&run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.nodes.len(), 8);
        assert!(snapshot.nodes.iter().all(|n| n.status == NodeRunStatus::Success));
    }

    /// Source-only graphs never reach the runner
    struct UnusedRunner;

    #[async_trait]
    impl TaskRunner for UnusedRunner {
        async fn submit(&self, unit: &str, _payload: Value) -> Result<TaskOutcome, TaskRunnerError> {
            Err(TaskRunnerError::Transport(format!("unexpected submission of '{}'", unit)))
        }
    }

    #[tokio::test]
    async fn test_supervisor_writes_through() {
        let recorder = Arc::new(SqliteRunRecorder::in_memory().unwrap());
        let supervisor = WorkflowSupervisor::new(NodeDispatcher::new(Arc::new(UnusedRunner)), recorder.clone());
        let graph = WorkflowBuilder::new()
            .text("prompt", "hello")
            .image("photo", "http://x/i.jpg")
            .build();

        let report = supervisor.run_workflow(graph).await.unwrap().wait().await.unwrap();

        let snapshot = recorder.run_snapshot(&report.run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert_eq!(snapshot.run.scope, RunScope::Full);
        assert_eq!(snapshot.node("prompt").unwrap().output, Some(json!({"text": "hello"})));
        assert_eq!(snapshot.node("photo").unwrap().output, Some(json!({"url": "http://x/i.jpg"})));
        assert!(snapshot.nodes.iter().all(|n| n.finished_at.is_some()));
    }
}
