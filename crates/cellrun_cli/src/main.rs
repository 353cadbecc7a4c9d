use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use cellrun_config::CellrunConfig;
use cellrun_session::notebook::{Cell, DocumentId, NotebookDocument};
use cellrun_session::{ExecutionCoordinator, ExecutionRecord, build_coordinator};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod terminal;

use terminal::TerminalHost;

/// Run markdown notebooks against a long-lived evaluation engine.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute every code cell of the given notebooks.
    Run {
        /// Path to the cellrun config file.
        config: PathBuf,
        /// Markdown notebooks. Each one gets its own engine session.
        #[arg(required = true)]
        notebooks: Vec<PathBuf>,
        /// Print one JSON record per executed cell instead of the cell output.
        #[arg(long)]
        json: bool,
    },
    /// Evaluate a single snippet.
    Eval {
        /// Path to the cellrun config file.
        config: PathBuf,
        source: String,
    },
    /// Load the config and engine, and start one instance.
    Check {
        /// Path to the cellrun config file.
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var(
                "RUST_LOG",
                "cellrun_cli=info,cellrun_runtime=info,cellrun_session=info",
            )
        };
    }

    let subscriber = tracing_subscriber::Registry::default()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::from_default_env());
    subscriber.try_init()?;

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            notebooks,
            json,
        } => {
            let coordinator = Arc::new(load_coordinator(&config).await?);
            let records = run_notebooks(&coordinator, notebooks, json).await;
            shutdown(&coordinator);
            let records = records?;
            if json {
                for record in &records {
                    println!("{}", serde_json::to_string(record)?);
                }
            }
            Ok(exit_code(&records))
        }
        Command::Eval { config, source } => {
            let cellrun_config = load_config(&config)?;
            let coordinator = build_coordinator(&cellrun_config).await?;
            let language = cellrun_config
                .notebook
                .languages
                .first()
                .cloned()
                .unwrap_or_default();
            let document = DocumentId::new("<eval>");
            let host = TerminalHost::new(document.clone(), false);
            let records = coordinator
                .execute(&document, &[Cell::code("cell-1", language, source)], &host)
                .await;
            shutdown(&coordinator);
            Ok(exit_code(&records))
        }
        Command::Check { config } => {
            let coordinator = load_coordinator(&config).await?;
            if let Some(sessions) = coordinator.sessions() {
                let instance = sessions.get_instance(&DocumentId::new("<check>")).await?;
                tracing::info!("instance {} is ready", instance.id());
            }
            shutdown(&coordinator);
            println!("{}: ok", config.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> Result<CellrunConfig> {
    CellrunConfig::load(path).map_err(|e| anyhow::anyhow!("Failed to load cellrun config: {}", e))
}

async fn load_coordinator(path: &Path) -> Result<ExecutionCoordinator> {
    let config = load_config(path)?;
    let coordinator = build_coordinator(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to set up engine `{}`: {}", config.name, e))?;
    Ok(coordinator)
}

/// Run all notebooks concurrently; cells within one notebook run in order.
async fn run_notebooks(
    coordinator: &Arc<ExecutionCoordinator>,
    notebooks: Vec<PathBuf>,
    quiet: bool,
) -> Result<Vec<ExecutionRecord>> {
    let mut documents = Vec::with_capacity(notebooks.len());
    for path in notebooks {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let id = DocumentId::new(path.display().to_string());
        documents.push(NotebookDocument::parse_markdown(id, &text));
    }

    let mut tasks = JoinSet::new();
    for (index, document) in documents.into_iter().enumerate() {
        let coordinator = Arc::clone(coordinator);
        tasks.spawn(async move {
            let host = TerminalHost::new(document.id.clone(), quiet);
            let records = coordinator.execute_document(&document, &host).await;
            coordinator.on_document_closed(&document.id);
            (index, records)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        results.push(joined?);
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().flat_map(|(_, records)| records).collect())
}

fn shutdown(coordinator: &ExecutionCoordinator) {
    if let Some(sessions) = coordinator.sessions() {
        let disposed = sessions.dispose_all();
        if disposed > 0 {
            tracing::debug!("disposed {} remaining session(s)", disposed);
        }
    }
}

fn exit_code(records: &[ExecutionRecord]) -> ExitCode {
    let failed = records.iter().filter(|record| !record.success).count();
    if failed > 0 {
        tracing::warn!("{} of {} cell(s) failed", failed, records.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
