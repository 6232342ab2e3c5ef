//! Streaming update model shared by every backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A capability invocation embedded in assistant output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Backend correlation id for matching the later result.
    pub id: Option<String>,
    /// Capability name (e.g. `Bash`, `Read`).
    pub name: String,
    /// Raw input parameters.
    pub input: serde_json::Value,
}

/// Structured metadata carried by the `system/init` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemInit {
    /// Capability roster offered to the model.
    pub tools: Vec<String>,
    /// Model identifier.
    pub model: Option<String>,
    /// Working directory reported by the backend.
    pub cwd: Option<String>,
    /// Permission mode reported by the backend.
    pub permission_mode: Option<String>,
}

/// One non-terminal message from a backend stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateKind {
    /// Assistant output: concatenated text and any capability calls.
    Assistant {
        /// Plain-text segments joined with newlines; `None` when absent.
        content: Option<String>,
        /// Capability calls in emission order.
        tool_calls: Vec<ToolCall>,
    },
    /// Outcome of a capability call.
    ToolResult {
        /// Id of the call this result answers.
        tool_use_id: Option<String>,
        /// Flattened result content.
        content: String,
        /// Whether the capability reported failure.
        is_error: bool,
        /// Mirror of `content` when `is_error` is set.
        error_message: Option<String>,
    },
    /// Echo of user input.
    User {
        /// Flattened user text.
        content: String,
    },
    /// System information.
    System {
        /// Message subtype (e.g. `init`).
        subtype: Option<String>,
        /// Free text for non-init subtypes.
        content: Option<String>,
        /// Structured metadata for the `init` subtype.
        init: Option<SystemInit>,
    },
    /// Error reported inside the stream.
    Error {
        /// Human-readable message.
        message: String,
        /// Optional machine code.
        code: Option<String>,
        /// Optional subtype.
        subtype: Option<String>,
    },
    /// Progress indication.
    Progress {
        /// Completion percentage.
        percentage: Option<f64>,
        /// Current step.
        step: Option<u32>,
        /// Total step count.
        total_steps: Option<u32>,
        /// Free-text status.
        status: Option<String>,
    },
    /// Well-formed message with a discriminator this parser does not know.
    Unrecognized {
        /// The discriminator as received.
        kind: String,
    },
}

/// A typed update delivered to the caller while an execution runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamUpdate {
    /// When the update was produced locally.
    pub timestamp: DateTime<Utc>,
    /// Backend session id carried by the message, if any.
    pub session_id: Option<String>,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub kind: UpdateKind,
}

impl StreamUpdate {
    /// Construct an update stamped with the current time.
    #[must_use]
    pub fn new(kind: UpdateKind, session_id: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            kind,
        }
    }

    /// Capability calls carried by this update (empty unless assistant).
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.kind {
            UpdateKind::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Stable name of the update kind, for logging.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match &self.kind {
            UpdateKind::Assistant { .. } => "assistant",
            UpdateKind::ToolResult { .. } => "tool_result",
            UpdateKind::User { .. } => "user",
            UpdateKind::System { .. } => "system",
            UpdateKind::Error { .. } => "error",
            UpdateKind::Progress { .. } => "progress",
            UpdateKind::Unrecognized { kind } => kind,
        }
    }
}
