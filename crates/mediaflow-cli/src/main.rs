use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use mediaflow_engine::{
    ChannelEventSink, EngineConfig, InMemoryRunRecorder, RunRecorder, WorkflowGraph,
    WorkflowSupervisor,
};
use mediaflow_store::SqliteRunRecorder;

#[derive(Parser)]
#[command(name = "mediaflow", version, about = "Run media and LLM workflow graphs")]
struct Cli {
    /// Path to an engine config file (JSON)
    #[arg(short, long, env = "MEDIAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database for run records (overrides the config)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph file and print the run report
    Run {
        /// Graph snapshot: {"nodes": [...], "edges": [...]}
        graph: PathBuf,
        /// Only run these nodes and their upstream dependencies
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Stream progress events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Print a recorded run and its node records
    Status {
        run_id: String,
    },
}

fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env()?;
    if let Some(db) = db {
        config.database_path = Some(db);
    }
    config.validate()?;
    Ok(config)
}

fn open_recorder(config: &EngineConfig) -> anyhow::Result<Arc<dyn RunRecorder>> {
    match &config.database_path {
        Some(path) => {
            let recorder = SqliteRunRecorder::open(path)
                .with_context(|| format!("Failed to open run database {}", path.display()))?;
            Ok(Arc::new(recorder))
        }
        None => {
            log::info!("No database configured, run records are kept in memory");
            Ok(Arc::new(InMemoryRunRecorder::new()))
        }
    }
}

async fn run(config: &EngineConfig, graph_path: &Path, nodes: Vec<String>, events: bool) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(graph_path)
        .with_context(|| format!("Failed to read graph {}", graph_path.display()))?;
    let graph: WorkflowGraph = serde_json::from_str(&content)
        .with_context(|| format!("Invalid graph {}", graph_path.display()))?;

    let mut supervisor = WorkflowSupervisor::new(config.http_dispatcher()?, open_recorder(config)?);

    let printer = if events {
        let (sink, mut rx) = ChannelEventSink::new();
        supervisor = supervisor.with_event_sink(Arc::new(sink));
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{}", line);
                }
            }
        }))
    } else {
        None
    };

    let handle = if nodes.is_empty() {
        supervisor.run_workflow(graph).await?
    } else {
        supervisor.run_nodes(&graph, &nodes).await?
    };
    log::info!("Started run {} ({})", handle.run_id, handle.scope.as_str());

    let report = handle.wait().await;
    // Closes the event channel so the printer drains and exits
    drop(supervisor);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn status(config: &EngineConfig, run_id: &str) -> anyhow::Result<()> {
    if config.database_path.is_none() {
        bail!("`status` needs a run database (--db, MEDIAFLOW_DATABASE or databasePath)");
    }
    let recorder = open_recorder(config)?;
    match recorder.run_snapshot(run_id).await? {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        None => bail!("Run '{}' not found", run_id),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.db)?;

    match cli.command {
        Commands::Run { graph, nodes, events } => run(&config, &graph, nodes, events).await,
        Commands::Status { run_id } => status(&config, &run_id).await,
    }
}
