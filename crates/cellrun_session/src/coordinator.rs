use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use serde::Serialize;

use crate::host::{CellExecution, CellOutput, HostError, NotebookHost, OutputItem};
use crate::notebook::{Cell, CellId, DocumentId, NotebookDocument};
use crate::process::ProcessRunner;
use crate::registry::SessionRegistry;

/// Where cells are evaluated.
pub enum Backend {
    /// One long-lived engine instance per document.
    Sessions(Arc<SessionRegistry>),
    /// A fresh external process per cell.
    Process(ProcessRunner),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed {
        stdout: String,
        stderr: String,
        /// Exit code of the evaluating process; absent for in-process engines.
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Failed {
        error: String,
        message: String,
    },
}

impl ExecutionOutcome {
    fn failed(error: &str, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failed {
            error: error.to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ExecutionOutcome::Completed {
                stderr, exit_code, ..
            } => stderr.is_empty() && exit_code.is_none_or(|code| code == 0),
            ExecutionOutcome::Failed { .. } => false,
        }
    }

    fn outputs(&self) -> Vec<CellOutput> {
        match self {
            ExecutionOutcome::Completed { stdout, stderr, .. } => {
                let mut outputs = vec![CellOutput::new(vec![OutputItem::stdout(stdout.clone())])];
                if !stderr.is_empty() {
                    outputs.push(CellOutput::new(vec![OutputItem::stderr(stderr.clone())]));
                }
                outputs
            }
            ExecutionOutcome::Failed { error, message } => {
                vec![CellOutput::new(vec![OutputItem::error(error.clone(), message.clone())])]
            }
        }
    }
}

/// One evaluated cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub document: DocumentId,
    pub cell: CellId,
    /// Absent when no instance could be obtained for the document.
    pub order: Option<u64>,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub outcome: ExecutionOutcome,
    pub success: bool,
}

/// Runs batches of cells against a backend and reports progress to the host.
pub struct ExecutionCoordinator {
    backend: Backend,
    languages: Vec<String>,
    /// Execution order counters for the process backend, which has no instance to count calls.
    process_orders: Mutex<HashMap<DocumentId, u64>>,
    /// Held for the length of a batch; later batches of a document queue behind it.
    batches: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExecutionCoordinator {
    pub fn new(backend: Backend, languages: Vec<String>) -> Self {
        Self {
            backend,
            languages,
            process_orders: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Session registry, when cells run in long-lived instances.
    pub fn sessions(&self) -> Option<&Arc<SessionRegistry>> {
        match &self.backend {
            Backend::Sessions(registry) => Some(registry),
            Backend::Process(_) => None,
        }
    }

    /// Host notification that `document` was closed.
    ///
    /// Ends the document's session and drops its per-document state, so a reopened
    /// document starts counting executions from 1 again. Returns whether a session
    /// was ended.
    pub fn on_document_closed(&self, document: &DocumentId) -> bool {
        let stopped = match &self.backend {
            Backend::Sessions(registry) => registry.on_document_closed(document),
            Backend::Process(_) => false,
        };
        self.forget(document);
        stopped
    }

    fn forget(&self, document: &DocumentId) {
        self.process_orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(document);
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(document);
    }

    /// Whether `cell` is code in one of the configured languages.
    pub fn supports(&self, cell: &Cell) -> bool {
        cell.language()
            .is_some_and(|language| self.languages.iter().any(|l| l == language))
    }

    pub async fn execute_document<H: NotebookHost>(
        &self,
        document: &NotebookDocument,
        host: &H,
    ) -> Vec<ExecutionRecord> {
        self.execute(&document.id, &document.cells, host).await
    }

    /// Execute a batch of cells one after another, in the given order.
    ///
    /// Unsupported cells are skipped. A failing cell does not stop the batch. Batches
    /// for the same document run one after another in the order they were submitted.
    pub async fn execute<H: NotebookHost>(
        &self,
        document: &DocumentId,
        cells: &[Cell],
        host: &H,
    ) -> Vec<ExecutionRecord> {
        let batch = self.batch_lock(document);
        let _batch = batch.lock().await;

        let mut records = Vec::new();
        for cell in cells {
            if !self.supports(cell) {
                tracing::debug!("{}: skipping {} ({:?})", document, cell.id, cell.kind);
                continue;
            }
            let mut execution = host.create_execution(cell);
            let record = match &self.backend {
                Backend::Sessions(registry) => {
                    self.run_in_session(registry, document, cell, &mut execution)
                        .await
                }
                Backend::Process(runner) => {
                    self.run_in_process(runner, document, cell, &mut execution)
                        .await
                }
            };
            records.push(record);
        }
        records
    }

    async fn run_in_session<E: CellExecution>(
        &self,
        registry: &SessionRegistry,
        document: &DocumentId,
        cell: &Cell,
        execution: &mut E,
    ) -> ExecutionRecord {
        let instance = match registry.get_instance(document).await {
            Ok(instance) => instance,
            Err(error) => {
                tracing::warn!("{}: no engine instance for {}: {}", document, cell.id, error);
                let started = Started::now(document, cell, None, execution);
                let outcome = ExecutionOutcome::failed(error.kind(), error.to_string());
                return started.finish(execution, outcome);
            }
        };

        let order = instance.run_count() + 1;
        let started = Started::now(document, cell, Some(order), execution);
        let outcome = match instance.run(&cell.source).await {
            Ok(output) => ExecutionOutcome::Completed {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: None,
            },
            Err(error) => {
                tracing::warn!("{}: {} failed: {}", document, cell.id, error);
                ExecutionOutcome::failed(error.kind(), error.to_string())
            }
        };
        started.finish(execution, outcome)
    }

    async fn run_in_process<E: CellExecution>(
        &self,
        runner: &ProcessRunner,
        document: &DocumentId,
        cell: &Cell,
        execution: &mut E,
    ) -> ExecutionRecord {
        let order = self.next_process_order(document);
        let started = Started::now(document, cell, Some(order), execution);

        let mut host_error: Option<HostError> = None;
        let result = runner
            .run(&cell.source, |item| {
                if host_error.is_none() {
                    host_error = execution.append_output_items(vec![item]).err();
                }
            })
            .await;

        let outcome = match (result, host_error) {
            (_, Some(error)) => {
                tracing::warn!("{}: host rejected streamed output of {}: {}", document, cell.id, error);
                ExecutionOutcome::failed("HostError", error.to_string())
            }
            (Ok(output), None) => match output.exit_code {
                Some(code) => ExecutionOutcome::Completed {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: Some(code),
                },
                None => ExecutionOutcome::failed(
                    "ProcessError",
                    format!("`{}` was terminated by a signal", runner.program()),
                ),
            },
            (Err(error), None) => ExecutionOutcome::failed(error.kind(), error.to_string()),
        };
        started.finish(execution, outcome)
    }

    fn batch_lock(&self, document: &DocumentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(batches.entry(document.clone()).or_default())
    }

    fn next_process_order(&self, document: &DocumentId) -> u64 {
        let mut orders = self
            .process_orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let order = orders.entry(document.clone()).or_insert(0);
        *order += 1;
        *order
    }
}

/// A cell execution that has been reported as started.
struct Started {
    document: DocumentId,
    cell: CellId,
    order: Option<u64>,
    started_at: SystemTime,
}

impl Started {
    fn now<E: CellExecution>(
        document: &DocumentId,
        cell: &Cell,
        order: Option<u64>,
        execution: &mut E,
    ) -> Self {
        if let Some(order) = order {
            execution.set_execution_order(order);
        }
        let started_at = SystemTime::now();
        execution.start(started_at);
        Self {
            document: document.clone(),
            cell: cell.id.clone(),
            order,
            started_at,
        }
    }

    /// Report the outcome to the host and end the execution.
    ///
    /// A host error while reporting turns the cell into a failure carrying that error.
    fn finish<E: CellExecution>(self, execution: &mut E, outcome: ExecutionOutcome) -> ExecutionRecord {
        let ended_at = SystemTime::now();
        let mut success = outcome.is_success();
        if let Err(error) = execution.replace_output(outcome.outputs()) {
            tracing::warn!("{}: failed to report output of {}: {}", self.document, self.cell, error);
            success = false;
            let fallback = vec![CellOutput::new(vec![OutputItem::error(
                "HostError",
                error.to_string(),
            )])];
            if let Err(error) = execution.replace_output(fallback) {
                tracing::warn!("{}: failed to report host error for {}: {}", self.document, self.cell, error);
            }
        }
        execution.end(success, ended_at);

        ExecutionRecord {
            document: self.document,
            cell: self.cell,
            order: self.order,
            started_at: self.started_at,
            ended_at,
            outcome,
            success,
        }
    }
}
