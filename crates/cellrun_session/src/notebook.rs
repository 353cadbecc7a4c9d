//! Documents and cells as seen by the execution coordinator.

use std::fmt;

use serde::Serialize;

/// Identity of an open document (e.g. the notebook's path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellKind {
    /// Code in `language`; empty when the fence carried no info string.
    Code { language: String },
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub id: CellId,
    pub kind: CellKind,
    pub source: String,
}

impl Cell {
    pub fn code(id: impl Into<String>, language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: CellId::new(id),
            kind: CellKind::Code {
                language: language.into(),
            },
            source: source.into(),
        }
    }

    pub fn language(&self) -> Option<&str> {
        match &self.kind {
            CellKind::Code { language } => Some(language),
            CellKind::Markdown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookDocument {
    pub id: DocumentId,
    pub cells: Vec<Cell>,
}

impl NotebookDocument {
    /// Split a markdown notebook into cells.
    ///
    /// Fenced code blocks (``` or ~~~) become code cells whose language is the first
    /// word of the info string; the prose between them becomes markdown cells. An
    /// unterminated fence runs to the end of the document.
    pub fn parse_markdown(id: DocumentId, text: &str) -> Self {
        let mut cells = Vec::new();
        let mut prose: Vec<&str> = Vec::new();
        let mut fence: Option<(Fence, String, Vec<&str>)> = None;

        for line in text.lines() {
            match fence.take() {
                Some((open, language, mut body)) => {
                    if open.is_closed_by(line) {
                        push_cell(&mut cells, CellKind::Code { language }, body.join("\n"));
                    } else {
                        body.push(line);
                        fence = Some((open, language, body));
                    }
                }
                None => match Fence::open(line) {
                    Some((open, language)) => {
                        push_prose(&mut cells, &mut prose);
                        fence = Some((open, language, Vec::new()));
                    }
                    None => prose.push(line),
                },
            }
        }

        if let Some((_, language, body)) = fence {
            push_cell(&mut cells, CellKind::Code { language }, body.join("\n"));
        }
        push_prose(&mut cells, &mut prose);

        Self { id, cells }
    }

    pub fn code_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells
            .iter()
            .filter(|cell| matches!(cell.kind, CellKind::Code { .. }))
    }
}

fn push_cell(cells: &mut Vec<Cell>, kind: CellKind, source: String) {
    let id = CellId::new(format!("cell-{}", cells.len() + 1));
    cells.push(Cell { id, kind, source });
}

fn push_prose(cells: &mut Vec<Cell>, prose: &mut Vec<&str>) {
    let source = prose.join("\n");
    prose.clear();
    let source = source.trim_matches('\n');
    if !source.trim().is_empty() {
        push_cell(cells, CellKind::Markdown, source.to_string());
    }
}

#[derive(Debug, Clone, Copy)]
struct Fence {
    marker: char,
    len: usize,
}

impl Fence {
    fn open(line: &str) -> Option<(Self, String)> {
        let trimmed = strip_indent(line)?;
        let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
        let len = trimmed.chars().take_while(|c| *c == marker).count();
        if len < 3 {
            return None;
        }
        let info = trimmed[len..].trim();
        // Backtick fences cannot carry backticks in their info string.
        if marker == '`' && info.contains('`') {
            return None;
        }
        let language = info.split_whitespace().next().unwrap_or_default().to_string();
        Some((Self { marker, len }, language))
    }

    fn is_closed_by(&self, line: &str) -> bool {
        let Some(trimmed) = strip_indent(line) else {
            return false;
        };
        let run = trimmed.chars().take_while(|c| *c == self.marker).count();
        run >= self.len && trimmed[run..].trim().is_empty()
    }
}

/// Fences may be indented by up to three spaces.
fn strip_indent(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    (indent <= 3).then(|| &line[indent..])
}
