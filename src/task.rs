//! Task and batch definitions.
//!
//! A task is one line of a client-submitted task list: an operation kind
//! plus the URL of the source document. Batches group consecutive task
//! lines up to a configured size and are dispatched to workers as a unit.
//!
//! Task lines are validated by the worker, not the dispatcher: the
//! dispatcher partitions raw lines blindly so that a malformed line still
//! reaches the worker and comes back as a per-task error entry in the
//! client's report instead of being silently dropped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when parsing a task line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskParseError {
    /// The line was empty or whitespace-only.
    #[error("empty task line")]
    Empty,

    /// The line did not have the `<operation> <document-url>` shape.
    #[error("expected '<operation> <document-url>', got '{0}'")]
    Malformed(String),

    /// The operation token is not part of the supported set.
    #[error("unsupported operation '{0}'")]
    UnknownOperation(String),
}

/// The closed set of document transforms a worker can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Extract the document body as normalized plain text.
    ToText,
    /// Wrap the document body in a minimal escaped HTML page.
    ToHtml,
    /// Produce the SHA-256 hex digest of the document bytes.
    ToDigest,
}

impl OperationKind {
    /// Parses an operation token, case-insensitively.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "TOTEXT" => Some(OperationKind::ToText),
            "TOHTML" => Some(OperationKind::ToHtml),
            "TODIGEST" => Some(OperationKind::ToDigest),
            _ => None,
        }
    }

    /// File extension of the derived artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            OperationKind::ToText => "txt",
            OperationKind::ToHtml => "html",
            OperationKind::ToDigest => "sha256",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::ToText => write!(f, "TOTEXT"),
            OperationKind::ToHtml => write!(f, "TOHTML"),
            OperationKind::ToDigest => write!(f, "TODIGEST"),
        }
    }
}

/// A single document-processing task. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// The transform to apply.
    pub operation: OperationKind,
    /// URL of the source document.
    pub source: String,
}

impl Task {
    /// Parses one task line of the form `<operation> <document-url>`.
    pub fn parse(line: &str) -> Result<Self, TaskParseError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(TaskParseError::Empty);
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(TaskParseError::Malformed(trimmed.to_string()));
        }

        let operation = OperationKind::parse(parts[0])
            .ok_or_else(|| TaskParseError::UnknownOperation(parts[0].to_string()))?;

        Ok(Self {
            operation,
            source: parts[1].to_string(),
        })
    }

    /// Derives the artifact file name from the source URL: the final path
    /// segment with its extension replaced by the operation's.
    ///
    /// Returns `None` when the URL has no usable file name.
    pub fn output_name(&self) -> Option<String> {
        let path = self.source.split(['?', '#']).next().unwrap_or_default();
        let segment = path.rsplit('/').next().unwrap_or_default();
        if segment.is_empty() {
            return None;
        }

        let stem = match segment.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => segment,
        };
        Some(format!("{}.{}", stem, self.operation.extension()))
    }
}

/// An ordered group of task lines dispatched to one worker as a unit.
///
/// The owning client identifier travels as a message attribute; the wire
/// body is the raw lines joined by newlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBatch {
    /// Identifier of the client that submitted these tasks.
    pub client_id: String,
    /// The raw task lines, in submission order.
    pub lines: Vec<String>,
}

impl TaskBatch {
    /// Splits a task-list text into consecutive batches of at most
    /// `tasks_per_batch` non-empty lines. The final partial batch, if any,
    /// is kept.
    pub fn partition(client_id: &str, text: &str, tasks_per_batch: usize) -> Vec<TaskBatch> {
        let size = tasks_per_batch.max(1);
        let lines: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        lines
            .chunks(size)
            .map(|chunk| TaskBatch {
                client_id: client_id.to_string(),
                lines: chunk.to_vec(),
            })
            .collect()
    }

    /// Reconstructs a batch from a wire body received off the dispatch queue.
    pub fn from_body(client_id: &str, body: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            lines: body
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Serializes the batch for the wire.
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }

    /// Number of task lines in the batch.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns whether the batch carries no task lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Parses each line into a [`Task`], keeping the original line alongside
    /// the outcome so malformed lines can be reported verbatim.
    pub fn tasks(&self) -> impl Iterator<Item = (&str, Result<Task, TaskParseError>)> {
        self.lines
            .iter()
            .map(|line| (line.as_str(), Task::parse(line)))
    }
}
