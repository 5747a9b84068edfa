use serde::{Deserialize, Serialize};
use std::fmt;

/// Script bodies are cut to this many characters when shown back to the oracle.
const SCRIPT_PREVIEW_CHARS: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { index: usize },
    Type { index: usize, text: String },
    Script { instructions: String },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { index } => write!(f, "click #{index}"),
            Action::Type { index, text } => write!(f, "type {text:?} into #{index}"),
            Action::Script { instructions } => {
                write!(f, "script: {}", preview(instructions, SCRIPT_PREVIEW_CHARS))
            }
        }
    }
}

/// What the oracle chose, with the element text it pointed at (if any).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub target: Option<String>,
    pub rationale: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Applied,
    NoEffect { reason: String },
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Applied => f.write_str("applied"),
            ExecutionOutcome::NoEffect { reason } => write!(f, "no effect ({reason})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub decision: Decision,
    pub outcome: Option<ExecutionOutcome>,
}

impl HistoryEntry {
    /// One line for prompt context: action, target, text, rationale, outcome.
    pub fn render(&self, step: usize) -> String {
        let d = &self.decision;
        let mut line = format!("- Step {step}: {}", d.action);
        if let Some(target) = &d.target {
            line.push_str(&format!(" '{target}'"));
        }
        if let Some(reason) = &d.rationale {
            line.push_str(&format!(" | reason: {reason}"));
        }
        if let Some(ExecutionOutcome::NoEffect { reason }) = &self.outcome {
            line.push_str(&format!(" | result: no effect ({reason})"));
        }
        line
    }
}

/// Append-only record of one goal's cycles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "None yet".to_string();
        }
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| e.render(i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Single-line preview, cut at `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    let flat = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    match flat.char_indices().nth(max) {
        Some((byte, _)) => format!("{}...", &flat[..byte]),
        None => flat,
    }
}
