//! Cells: the parser that splits a source file into runnable units, and the
//! per-cell state the session controller keeps for each of them.
//!
//! A file is split on comment markers at the start of a line:
//!
//! ```text
//! # %%% Optional title        markdown cell, following `#` lines are its body
//! # --- Optional label        code cell
//! ```

use serde::Serialize;

use crate::protocol::Stream;

const CODE_MARKER: &str = "# ---";
/// Not `# ===`: markdown bodies use `# ===` lines to underline headings, so
/// that form has to stay plain body text.
const MARKDOWN_MARKER: &str = "# %%%";

/// Kind of cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Code,
    Markdown,
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellKind::Code => write!(f, "code"),
            CellKind::Markdown => write!(f, "markdown"),
        }
    }
}

/// Execution state of a cell.
///
/// `Idle` and the three terminal states are resting states; `Pending` and
/// `Running` always resolve to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    Idle,
    Pending,
    Running,
    Succeeded,
    Failed,
    Interrupted,
}

impl CellState {
    /// Whether a cell may rest in this state between commands.
    pub fn is_resting(self) -> bool {
        !matches!(self, CellState::Pending | CellState::Running)
    }

    /// Whether a run may be requested from this state.
    pub fn can_run(self) -> bool {
        self.is_resting()
    }

    /// Allowed edges of the per-cell state machine.
    ///
    /// `Pending -> resting` covers a queued cell that is cancelled before it
    /// was dispatched, or a dispatched run that failed before the kernel
    /// accepted it. Any state may drop to `Idle` on kernel restart.
    pub fn can_transition_to(self, next: CellState) -> bool {
        use CellState::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle | Succeeded | Failed | Interrupted, Pending) => true,
            (Pending, Running) => true,
            (Pending, Succeeded | Failed | Interrupted) => true,
            (Running, Succeeded | Failed | Interrupted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellState::Idle => write!(f, "idle"),
            CellState::Pending => write!(f, "pending"),
            CellState::Running => write!(f, "running"),
            CellState::Succeeded => write!(f, "succeeded"),
            CellState::Failed => write!(f, "failed"),
            CellState::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// One piece of output produced by a run, in production order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChunk {
    pub stream: Stream,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn new(stream: Stream, data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream,
            data: data.into(),
        }
    }
}

/// A unit of the source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    /// Ordinal position in the file.
    pub id: usize,
    pub kind: CellKind,
    /// Free text after the marker. Display only.
    pub label: Option<String>,
    /// Cell body; for markdown cells the comment prefix is stripped.
    pub source: String,
    /// First line of the cell (its marker line, when it has one), 1-based.
    pub line_start: usize,
    /// Last line belonging to the cell, inclusive.
    pub line_end: usize,
    state: CellState,
    output: Vec<OutputChunk>,
    error: Option<String>,
}

impl Cell {
    fn new(
        id: usize,
        kind: CellKind,
        label: Option<String>,
        source: String,
        line_start: usize,
        line_end: usize,
    ) -> Self {
        Self {
            id,
            kind,
            label,
            source,
            line_start,
            line_end,
            state: CellState::Idle,
            output: Vec::new(),
            error: None,
        }
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn output(&self) -> &[OutputChunk] {
        &self.output
    }

    /// Error detail of the last failed or interrupted run.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// All output bytes of the current run, concatenated in delivery order.
    pub fn output_bytes(&self) -> Vec<u8> {
        self.output.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    /// Output as text, with invalid UTF-8 replaced.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output_bytes()).into_owned()
    }

    /// Label truncated to `max` characters, with `...` appended when cut.
    pub fn display_label(&self, max: usize) -> Option<String> {
        self.label.as_ref().map(|label| {
            if label.chars().count() > max {
                let cut: String = label.chars().take(max).collect();
                format!("{}...", cut)
            } else {
                label.clone()
            }
        })
    }

    /// Heading shown above a cell: `label - N - [state]`.
    pub fn title(&self, max_label: usize) -> String {
        let state = match self.state {
            CellState::Idle => String::new(),
            other => format!(" - [{}]", other.to_string().to_uppercase()),
        };
        match self.display_label(max_label) {
            Some(label) => format!("{} - {}{}", label, self.id + 1, state),
            None => format!("{}{}", self.id + 1, state),
        }
    }

    /// Whether `other` is the same cell at the same position, so its run
    /// state may carry over across a re-parse.
    pub fn same_content(&self, other: &Cell) -> bool {
        self.id == other.id && self.kind == other.kind && self.source == other.source
    }

    pub(crate) fn set_state(&mut self, next: CellState) {
        if !self.state.can_transition_to(next) {
            log::error!(
                "[cell] Illegal transition for cell {}: {} -> {}",
                self.id,
                self.state,
                next
            );
        }
        self.state = next;
    }

    pub(crate) fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub(crate) fn push_output(&mut self, chunk: OutputChunk) {
        // Consecutive writes to the same stream are merged to keep the
        // buffer short for chatty cells.
        if let Some(last) = self.output.last_mut() {
            if last.stream == chunk.stream && chunk.stream != Stream::Result {
                last.data.extend_from_slice(&chunk.data);
                return;
            }
        }
        self.output.push(chunk);
    }

    pub(crate) fn clear_output(&mut self) {
        self.output.clear();
        self.error = None;
    }

    /// Carry run state and output over from the previous parse.
    pub(crate) fn inherit(&mut self, previous: Cell) {
        self.state = previous.state;
        self.output = previous.output;
        self.error = previous.error;
    }
}

/// Which marker, if any, starts `line`, and the label that follows it.
fn marker(line: &str) -> Option<(CellKind, Option<String>)> {
    let (kind, rest) = if let Some(rest) = line.strip_prefix(CODE_MARKER) {
        (CellKind::Code, rest)
    } else {
        (CellKind::Markdown, line.strip_prefix(MARKDOWN_MARKER)?)
    };
    let label = rest.trim();
    let label = (!label.is_empty()).then(|| label.to_string());
    Some((kind, label))
}

/// Strip the comment prefix from a markdown body line. Lines that are not
/// comments are kept verbatim.
fn strip_comment(line: &str) -> &str {
    match line.strip_prefix('#') {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    }
}

struct Draft<'a> {
    kind: CellKind,
    label: Option<String>,
    marked: bool,
    line_start: usize,
    lines: Vec<&'a str>,
}

impl<'a> Draft<'a> {
    fn keep(&self) -> bool {
        self.marked || self.lines.iter().any(|l| !l.trim().is_empty())
    }

    fn finish(self, id: usize) -> Cell {
        let body: Vec<&str> = match self.kind {
            CellKind::Code => self.lines.clone(),
            CellKind::Markdown => self.lines.iter().map(|l| strip_comment(l)).collect(),
        };
        let line_end = if self.marked {
            self.line_start + self.lines.len()
        } else {
            (self.line_start + self.lines.len()).saturating_sub(1).max(1)
        };
        Cell::new(
            id,
            self.kind,
            self.label,
            body.join("\n"),
            self.line_start,
            line_end,
        )
    }
}

/// Split source text into cells.
///
/// Never fails: any text yields at least one cell, and the same text always
/// yields the same cells.
pub fn parse(text: &str) -> Vec<Cell> {
    let text = text.trim_end();
    let mut cells = Vec::new();
    let mut current = Draft {
        kind: CellKind::Code,
        label: None,
        marked: false,
        line_start: 1,
        lines: Vec::new(),
    };

    for (idx, line) in text.lines().enumerate() {
        match marker(line) {
            Some((kind, label)) => {
                let previous = std::mem::replace(
                    &mut current,
                    Draft {
                        kind,
                        label,
                        marked: true,
                        line_start: idx + 1,
                        lines: Vec::new(),
                    },
                );
                if previous.keep() {
                    cells.push(previous.finish(cells.len()));
                }
            }
            None => current.lines.push(line),
        }
    }
    if current.keep() {
        cells.push(current.finish(cells.len()));
    }

    if cells.is_empty() {
        cells.push(Cell::new(0, CellKind::Code, None, String::new(), 1, 1));
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    const README_NOTEBOOK: &str = "\
# %%%
# My Notebook
# ===========
#
# Welcome to my **not-a-notebook**!


# --- Do some imports
import os
import json


# --- Set a var
hello_abc = \"Hello ABC!\"

# --- Print it
print(hello_abc)

# ---
# This cell has no name, which is also fine
print(\"Hello world\")
";

    #[test]
    fn test_parse_readme_notebook() {
        let cells = parse(README_NOTEBOOK);
        assert_eq!(cells.len(), 5);

        assert_eq!(cells[0].kind, CellKind::Markdown);
        assert_eq!(cells[0].label, None);
        assert!(cells[0].source.starts_with("My Notebook\n===========\n\nWelcome"));

        assert_eq!(cells[1].kind, CellKind::Code);
        assert_eq!(cells[1].label.as_deref(), Some("Do some imports"));
        assert!(cells[1].source.contains("import json"));

        assert_eq!(cells[3].label.as_deref(), Some("Print it"));
        assert_eq!(cells[3].source.trim(), "print(hello_abc)");

        assert_eq!(cells[4].label, None);
        assert!(cells[4].source.starts_with("# This cell has no name"));

        for (i, cell) in cells.iter().enumerate() {
            assert_eq!(cell.id, i);
            assert_eq!(cell.state(), CellState::Idle);
        }
    }

    #[test]
    fn test_parse_preamble_is_implicit_code_cell() {
        let cells = parse("x = 1\n# --- second\ny = 2\n");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].kind, CellKind::Code);
        assert_eq!(cells[0].label, None);
        assert_eq!(cells[0].source, "x = 1");
        assert_eq!(cells[0].line_start, 1);
        assert_eq!(cells[0].line_end, 1);
        assert_eq!(cells[1].source, "y = 2");
        assert_eq!(cells[1].line_start, 2);
        assert_eq!(cells[1].line_end, 3);
    }

    #[test]
    fn test_parse_blank_preamble_is_dropped() {
        let cells = parse("\n\n# --- only\nprint(1)");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].label.as_deref(), Some("only"));
    }

    #[test]
    fn test_parse_empty_input_yields_one_cell() {
        for text in ["", "   ", "\n\n\n"] {
            let cells = parse(text);
            assert_eq!(cells.len(), 1);
            assert_eq!(cells[0].kind, CellKind::Code);
            assert_eq!(cells[0].source, "");
        }
    }

    #[test]
    fn test_parse_no_markers_is_single_cell() {
        let cells = parse("a = 1\nb = 2\n\nprint(a + b)\n");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].source, "a = 1\nb = 2\n\nprint(a + b)");
    }

    #[test]
    fn test_parse_markdown_strips_comment_prefix() {
        let cells = parse("# %%% Intro\n# Title\n#\n#no space\n# --- code\n1");
        assert_eq!(cells[0].kind, CellKind::Markdown);
        assert_eq!(cells[0].label.as_deref(), Some("Intro"));
        assert_eq!(cells[0].source, "Title\n\nno space");
    }

    #[test]
    fn test_parse_markdown_keeps_stray_code_line() {
        let cells = parse("# %%%\n# prose\nnot a comment\n");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].source, "prose\nnot a comment");
    }

    #[test]
    fn test_parse_marker_without_body() {
        let cells = parse("# --- a\n# --- b\nx");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].source, "");
        assert_eq!(cells[1].source, "x");
    }

    #[test]
    fn test_parse_is_deterministic() {
        assert_eq!(parse(README_NOTEBOOK), parse(README_NOTEBOOK));
    }

    #[test]
    fn test_parse_keeps_all_code_lines() {
        let text = "p = 0\n# --- one\nq = 1\n\n# --- two\nr = 2";
        let cells = parse(text);
        let code: Vec<&str> = cells
            .iter()
            .flat_map(|c| c.source.lines())
            .filter(|l| !l.trim().is_empty())
            .collect();
        assert_eq!(code, vec!["p = 0", "q = 1", "r = 2"]);
    }

    #[test]
    fn test_display_label_truncates() {
        let cells = parse("# --- A rather long label for a cell\nx");
        assert_eq!(
            cells[0].display_label(20).as_deref(),
            Some("A rather long label ...")
        );
        assert_eq!(
            cells[0].display_label(100).as_deref(),
            Some("A rather long label for a cell")
        );
    }

    #[test]
    fn test_title() {
        let mut cells = parse("# --- load\nx\n# ---\ny");
        assert_eq!(cells[0].title(20), "load - 1");
        cells[1].set_state(CellState::Pending);
        assert_eq!(cells[1].title(20), "2 - [PENDING]");
    }

    #[test]
    fn test_state_machine_edges() {
        use CellState::*;
        assert!(Idle.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Interrupted));
        assert!(Failed.can_transition_to(Pending));
        assert!(Running.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Running));
    }

    #[test]
    fn test_push_output_merges_same_stream() {
        let mut cell = parse("x").remove(0);
        cell.push_output(OutputChunk::new(Stream::Stdout, "a"));
        cell.push_output(OutputChunk::new(Stream::Stdout, "b"));
        cell.push_output(OutputChunk::new(Stream::Stderr, "c"));
        cell.push_output(OutputChunk::new(Stream::Stdout, "d"));
        assert_eq!(cell.output().len(), 3);
        assert_eq!(cell.output_text(), "abcd");
    }
}
