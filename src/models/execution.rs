//! Execution request and result model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request to run the backend once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Prompt text; the empty string means "continue without new input".
    pub prompt: String,
    /// Directory the backend runs in.
    pub working_directory: PathBuf,
    /// Existing session to resolve, if any.
    pub session_id: Option<String>,
    /// Whether this continues a confirmed session.
    pub continue_session: bool,
}

/// One capability invocation observed during an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUsage {
    /// Capability name.
    pub name: String,
    /// When the invocation was observed.
    pub timestamp: DateTime<Utc>,
    /// Raw input parameters.
    pub input: serde_json::Value,
}

/// Why a completed execution is marked as errored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultErrorKind {
    /// The backend hit its turn cap.
    MaxTurns,
    /// The backend failed while executing.
    DuringExecution,
    /// The backend reported another error subtype.
    Backend {
        /// Raw subtype as reported.
        subtype: String,
    },
    /// Non-critical capability invocations were blocked during the run.
    ToolValidation {
        /// Blocked names in the order they were seen.
        blocked: Vec<String>,
    },
}

impl ResultErrorKind {
    /// Map a terminal message subtype to an error kind.
    #[must_use]
    pub fn from_subtype(subtype: &str) -> Self {
        match subtype {
            "error_max_turns" => Self::MaxTurns,
            "error_during_execution" => Self::DuringExecution,
            other => Self::Backend {
                subtype: other.to_owned(),
            },
        }
    }
}

/// Post-hoc summary of the bounded raw message buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamSummary {
    /// Number of raw messages retained.
    pub message_count: usize,
    /// Distinct capability names, in first-use order.
    pub tools: Vec<String>,
    /// Files read or modified.
    pub files_touched: Vec<String>,
    /// Shell commands run.
    pub commands: Vec<String>,
}

/// Final outcome of one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// Final text content.
    pub content: String,
    /// Resolved session id.
    pub session_id: String,
    /// Cost in USD.
    pub cost: f64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Backend turns consumed.
    pub num_turns: u32,
    /// Whether the execution is marked as errored.
    pub is_error: bool,
    /// Error classification when `is_error` is set.
    pub error_kind: Option<ResultErrorKind>,
    /// Capability invocations observed, in order.
    pub tools_used: Vec<ToolUsage>,
    /// Summary of the retained raw messages, when the backend keeps them.
    pub summary: Option<StreamSummary>,
}
