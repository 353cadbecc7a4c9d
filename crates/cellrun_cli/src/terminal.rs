//! Host that prints finished cells to the terminal.

use std::io::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

use cellrun_session::host::{CellExecution, CellOutput, HostError, NotebookHost, OutputItem};
use cellrun_session::notebook::{Cell, CellId, DocumentId};

pub struct TerminalHost {
    document: Arc<DocumentId>,
    quiet: bool,
}

impl TerminalHost {
    /// A `quiet` host accepts output but prints nothing.
    pub fn new(document: DocumentId, quiet: bool) -> Self {
        Self {
            document: Arc::new(document),
            quiet,
        }
    }
}

impl NotebookHost for TerminalHost {
    type Execution = TerminalExecution;

    fn create_execution(&self, cell: &Cell) -> TerminalExecution {
        TerminalExecution {
            document: Arc::clone(&self.document),
            cell: cell.id.clone(),
            quiet: self.quiet,
            order: None,
            outputs: Vec::new(),
        }
    }
}

pub struct TerminalExecution {
    document: Arc<DocumentId>,
    cell: CellId,
    quiet: bool,
    order: Option<u64>,
    outputs: Vec<CellOutput>,
}

impl CellExecution for TerminalExecution {
    fn set_execution_order(&mut self, order: u64) {
        self.order = Some(order);
    }

    fn start(&mut self, _at: SystemTime) {
        tracing::debug!("{}: running {}", self.document, self.cell);
    }

    fn replace_output(&mut self, outputs: Vec<CellOutput>) -> Result<(), HostError> {
        self.outputs = outputs;
        Ok(())
    }

    fn append_output_items(&mut self, items: Vec<OutputItem>) -> Result<(), HostError> {
        // Only the final output is printed.
        tracing::trace!("{}: {} produced {} item(s)", self.document, self.cell, items.len());
        Ok(())
    }

    fn end(&mut self, success: bool, _at: SystemTime) {
        if self.quiet {
            return;
        }
        let order = self
            .order
            .map(|order| format!("[{order}]"))
            .unwrap_or_else(|| "[ ]".to_string());
        let status = if success { "ok" } else { "FAILED" };

        // One write per cell keeps concurrently running documents from interleaving.
        let mut block = format!("{} {} {}: {}\n", self.document, self.cell, order, status);
        for output in &self.outputs {
            for item in &output.items {
                match item {
                    OutputItem::Stdout { text } => push_indented(&mut block, "", text),
                    OutputItem::Stderr { text } => push_indented(&mut block, "! ", text),
                    OutputItem::Error { name, message } => {
                        push_indented(&mut block, "! ", &format!("{name}: {message}"))
                    }
                }
            }
        }
        let _ = std::io::stdout().lock().write_all(block.as_bytes());
    }
}

fn push_indented(block: &mut String, marker: &str, text: &str) {
    for line in text.lines() {
        block.push_str("    ");
        block.push_str(marker);
        block.push_str(line);
        block.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indents_every_line() {
        let mut block = String::new();
        push_indented(&mut block, "! ", "one\ntwo\n");
        assert_eq!(block, "    ! one\n    ! two\n");
    }
}
