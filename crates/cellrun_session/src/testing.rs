//! In-memory [`NotebookHost`] that records every call, for tests and embedders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use crate::host::{CellExecution, CellOutput, HostError, NotebookHost, OutputItem};
use crate::notebook::{Cell, CellId};

/// A call made by the coordinator on a cell execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Order(u64),
    Started,
    Replaced(Vec<CellOutput>),
    Appended(Vec<OutputItem>),
    Ended { success: bool },
}

#[derive(Default)]
struct Shared {
    events: Mutex<HashMap<CellId, Vec<ExecutionEvent>>>,
    fail_replace: AtomicBool,
}

#[derive(Clone, Default)]
pub struct RecordingHost {
    shared: Arc<Shared>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `replace_output` call fail.
    pub fn fail_next_replace(&self) {
        self.shared.fail_replace.store(true, Ordering::SeqCst);
    }

    pub fn events(&self, cell: &str) -> Vec<ExecutionEvent> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&CellId::new(cell))
            .cloned()
            .unwrap_or_default()
    }

    /// The output blocks the cell currently shows.
    pub fn outputs(&self, cell: &str) -> Vec<CellOutput> {
        self.events(cell)
            .into_iter()
            .filter_map(|event| match event {
                ExecutionEvent::Replaced(outputs) => Some(outputs),
                _ => None,
            })
            .last()
            .unwrap_or_default()
    }

    pub fn order(&self, cell: &str) -> Option<u64> {
        self.events(cell).into_iter().find_map(|event| match event {
            ExecutionEvent::Order(order) => Some(order),
            _ => None,
        })
    }

    pub fn ended(&self, cell: &str) -> Option<bool> {
        self.events(cell).into_iter().find_map(|event| match event {
            ExecutionEvent::Ended { success } => Some(success),
            _ => None,
        })
    }
}

impl NotebookHost for RecordingHost {
    type Execution = RecordedExecution;

    fn create_execution(&self, cell: &Cell) -> RecordedExecution {
        RecordedExecution {
            cell: cell.id.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

pub struct RecordedExecution {
    cell: CellId,
    shared: Arc<Shared>,
}

impl RecordedExecution {
    fn record(&self, event: ExecutionEvent) {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.cell.clone())
            .or_default()
            .push(event);
    }
}

impl CellExecution for RecordedExecution {
    fn set_execution_order(&mut self, order: u64) {
        self.record(ExecutionEvent::Order(order));
    }

    fn start(&mut self, _at: SystemTime) {
        self.record(ExecutionEvent::Started);
    }

    fn replace_output(&mut self, outputs: Vec<CellOutput>) -> Result<(), HostError> {
        if self.shared.fail_replace.swap(false, Ordering::SeqCst) {
            return Err(HostError("cell is no longer displayed".to_string()));
        }
        self.record(ExecutionEvent::Replaced(outputs));
        Ok(())
    }

    fn append_output_items(&mut self, items: Vec<OutputItem>) -> Result<(), HostError> {
        self.record(ExecutionEvent::Appended(items));
        Ok(())
    }

    fn end(&mut self, success: bool, _at: SystemTime) {
        self.record(ExecutionEvent::Ended { success });
    }
}
