//! Protocol parser for the backend's streaming structured output.
//!
//! Each line is one self-contained JSON object carrying a `type`
//! discriminator. [`parse_line`] turns one line into at most one
//! [`StreamUpdate`], or into the terminal [`ExecutionResult`] when the
//! discriminator is `result`.
//!
//! # Known kinds
//!
//! | `type`        | Maps to                                   |
//! |---------------|-------------------------------------------|
//! | `assistant`   | [`UpdateKind::Assistant`]                 |
//! | `tool_result` | [`UpdateKind::ToolResult`]                |
//! | `user`        | [`UpdateKind::User`] or `ToolResult`      |
//! | `system`      | [`UpdateKind::System`]                    |
//! | `error`       | [`UpdateKind::Error`]                     |
//! | `progress`    | [`UpdateKind::Progress`]                  |
//! | `result`      | terminal [`ExecutionResult`]              |
//! | *(other)*     | [`UpdateKind::Unrecognized`]              |

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::models::execution::{ExecutionResult, ResultErrorKind};
use crate::models::stream::{StreamUpdate, SystemInit, ToolCall, UpdateKind};
use crate::{AppError, Result};

// ── Wire types ───────────────────────────────────────────────────────────────

/// One segment of a message's `content` array.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// Segment text.
        text: String,
    },
    /// Capability invocation.
    ToolUse {
        /// Correlation id.
        #[serde(default)]
        id: Option<String>,
        /// Capability name.
        name: String,
        /// Input parameters.
        #[serde(default)]
        input: Value,
    },
    /// Capability outcome.
    ToolResult {
        /// Id of the answered call.
        #[serde(default)]
        tool_use_id: Option<String>,
        /// String or list of text segments.
        #[serde(default)]
        content: Value,
        /// Failure flag.
        #[serde(default)]
        is_error: Option<bool>,
    },
    /// Any other segment kind (e.g. thinking).
    #[serde(other)]
    Other,
}

/// Body of an `assistant` or `user` message.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct MessageBody {
    /// String, or list of [`ContentBlock`]s.
    #[serde(default)]
    pub content: Value,
    /// Model identifier, on assistant messages.
    #[serde(default)]
    pub model: Option<String>,
}

/// Fields of the terminal `result` message.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ResultMessage {
    /// `success`, `error_max_turns`, `error_during_execution`, …
    #[serde(default)]
    pub subtype: Option<String>,
    /// Final text.
    #[serde(default)]
    pub result: Option<String>,
    /// Backend-assigned session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Cost in USD.
    #[serde(default, alias = "cost_usd")]
    pub total_cost_usd: Option<f64>,
    /// Duration in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Turns consumed.
    #[serde(default)]
    pub num_turns: Option<u32>,
    /// Error flag.
    #[serde(default)]
    pub is_error: bool,
}

impl ResultMessage {
    /// Convert into an [`ExecutionResult`] with no observed tool usage yet.
    #[must_use]
    pub fn into_result(self) -> ExecutionResult {
        let error_kind = self
            .is_error
            .then(|| ResultErrorKind::from_subtype(self.subtype.as_deref().unwrap_or("error")));
        ExecutionResult {
            content: self.result.unwrap_or_default(),
            session_id: self.session_id.unwrap_or_default(),
            cost: self.total_cost_usd.unwrap_or(0.0),
            duration_ms: self.duration_ms.unwrap_or(0),
            num_turns: self.num_turns.unwrap_or(0),
            is_error: self.is_error,
            error_kind,
            tools_used: Vec::new(),
            summary: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Result of parsing one line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A non-terminal update.
    Update(StreamUpdate),
    /// The terminal message.
    Result(ExecutionResult),
    /// Blank line; nothing to emit.
    Empty,
}

/// Parse one decoded line of backend output.
///
/// # Errors
///
/// - [`AppError::Parsing`]`("malformed json: …")` when the line is not a JSON object.
/// - [`AppError::Parsing`]`("missing type discriminator")` when `type` is absent.
///
/// Callers count these and keep reading; they never end the stream.
pub fn parse_line(line: &str) -> Result<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ParsedLine::Empty);
    }

    let envelope: Envelope = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Parsing(format!("malformed json: {e}")))?;
    let kind = envelope
        .kind
        .ok_or_else(|| AppError::Parsing("missing type discriminator".into()))?;
    let session_id = envelope.session_id;
    let rest = envelope.rest;

    let update_kind = match kind.as_str() {
        "result" => {
            let mut fields = rest;
            fields.insert("session_id".into(), session_id.map_or(Value::Null, Value::String));
            fields.insert(
                "subtype".into(),
                envelope.subtype.map_or(Value::Null, Value::String),
            );
            let message: ResultMessage = serde_json::from_value(Value::Object(fields))
                .map_err(|e| AppError::Parsing(format!("invalid result message: {e}")))?;
            return Ok(ParsedLine::Result(message.into_result()));
        }
        "assistant" => assistant_kind(&message_content(&rest)),
        "user" => user_kind(&message_content(&rest)),
        "tool_result" => standalone_tool_result(&rest),
        "system" => system_kind(envelope.subtype, &rest),
        "error" => error_kind(envelope.subtype, &rest),
        "progress" => progress_kind(&rest),
        _ => UpdateKind::Unrecognized { kind },
    };

    Ok(ParsedLine::Update(StreamUpdate::new(update_kind, session_id)))
}

/// Build the assistant update for a message `content` value.
///
/// Text segments are joined with newlines; capability invocations are
/// collected in order. Both travel on the same update.
#[must_use]
pub fn assistant_kind(content: &Value) -> UpdateKind {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in content_blocks(content) {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall { id, name, input });
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    UpdateKind::Assistant {
        content: (!texts.is_empty()).then(|| texts.join("\n")),
        tool_calls,
    }
}

/// Build the update for a `user` message `content` value.
///
/// Tool-result segments produce a [`UpdateKind::ToolResult`]; anything else
/// is flattened into a [`UpdateKind::User`] echo.
#[must_use]
pub fn user_kind(content: &Value) -> UpdateKind {
    let blocks = content_blocks(content);
    let results: Vec<&ContentBlock> = blocks
        .iter()
        .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
        .collect();

    if results.is_empty() {
        return UpdateKind::User {
            content: flatten_text(content),
        };
    }

    let mut first_id = None;
    let mut parts = Vec::new();
    let mut any_error = false;
    for block in results {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = block
        {
            if first_id.is_none() {
                first_id.clone_from(tool_use_id);
            }
            parts.push(flatten_text(content));
            any_error |= is_error.unwrap_or(false);
        }
    }
    tool_result_kind(first_id, parts.join("\n"), any_error)
}

/// Build the system update from a subtype and the remaining message fields.
#[must_use]
pub fn system_kind(subtype: Option<String>, fields: &Map<String, Value>) -> UpdateKind {
    if subtype.as_deref() == Some("init") {
        let tools = fields
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let init = SystemInit {
            tools,
            model: string_field(fields, &["model"]),
            cwd: string_field(fields, &["cwd"]),
            permission_mode: string_field(fields, &["permissionMode", "permission_mode"]),
        };
        return UpdateKind::System {
            subtype,
            content: None,
            init: Some(init),
        };
    }

    UpdateKind::System {
        subtype,
        content: string_field(fields, &["message", "content"]),
        init: None,
    }
}

/// Flatten a string or list of text segments into one string.
#[must_use]
pub fn flatten_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(str::to_owned),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ── Private helpers ──────────────────────────────────────────────────────────

fn message_content(fields: &Map<String, Value>) -> Value {
    fields
        .get("message")
        .and_then(|m| m.get("content"))
        .cloned()
        .unwrap_or(Value::Null)
}

fn content_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(text) => vec![ContentBlock::Text { text: text.clone() }],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                serde_json::from_value(item.clone()).unwrap_or(ContentBlock::Other)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn standalone_tool_result(fields: &Map<String, Value>) -> UpdateKind {
    let nested = fields.get("result").and_then(Value::as_object);
    let source = nested.unwrap_or(fields);
    let content = source.get("content").map(flatten_text).unwrap_or_default();
    let is_error = source
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let tool_use_id = string_field(fields, &["tool_use_id"]);
    tool_result_kind(tool_use_id, content, is_error)
}

fn tool_result_kind(tool_use_id: Option<String>, content: String, is_error: bool) -> UpdateKind {
    let error_message = is_error.then(|| content.clone());
    UpdateKind::ToolResult {
        tool_use_id,
        content,
        is_error,
        error_message,
    }
}

fn error_kind(subtype: Option<String>, fields: &Map<String, Value>) -> UpdateKind {
    let message = string_field(fields, &["message"])
        .or_else(|| match fields.get("error") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Object(obj)) => obj.get("message").and_then(Value::as_str).map(str::to_owned),
            _ => None,
        })
        .unwrap_or_else(|| "Unknown error".to_owned());
    UpdateKind::Error {
        message,
        code: string_field(fields, &["code"]),
        subtype,
    }
}

fn progress_kind(fields: &Map<String, Value>) -> UpdateKind {
    let counter = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    };
    UpdateKind::Progress {
        percentage: fields.get("percentage").and_then(Value::as_f64),
        step: counter("step"),
        total_steps: counter("total_steps"),
        status: string_field(fields, &["status", "message"]),
    }
}

fn string_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}
