//! Interface to the host UI that displays cell executions.

use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;

use crate::notebook::Cell;

/// Error raised by the host while accepting output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputItem {
    Stdout { text: String },
    Stderr { text: String },
    Error { name: String, message: String },
}

impl OutputItem {
    pub fn stdout(text: impl Into<String>) -> Self {
        OutputItem::Stdout { text: text.into() }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        OutputItem::Stderr { text: text.into() }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        OutputItem::Error {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// One output block of a cell; a cell may show several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellOutput {
    pub items: Vec<OutputItem>,
}

impl CellOutput {
    pub fn new(items: Vec<OutputItem>) -> Self {
        Self { items }
    }
}

/// Host-side handle for one cell execution.
pub trait CellExecution: Send {
    fn set_execution_order(&mut self, order: u64);

    fn start(&mut self, at: SystemTime);

    /// Replace everything the cell currently shows.
    fn replace_output(&mut self, outputs: Vec<CellOutput>) -> Result<(), HostError>;

    /// Add items to the cell's output while it is still running.
    fn append_output_items(&mut self, items: Vec<OutputItem>) -> Result<(), HostError>;

    fn end(&mut self, success: bool, at: SystemTime);
}

/// The host UI of one or more documents.
pub trait NotebookHost: Sync {
    type Execution: CellExecution;

    fn create_execution(&self, cell: &Cell) -> Self::Execution;
}
