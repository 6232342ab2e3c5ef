//! Post-hoc audit utilities over a captured raw message list.
//!
//! These run after an execution finishes, independently of the live
//! per-line parse, and answer "which files were touched" and "which shell
//! commands ran".

use serde_json::Value;

use crate::models::execution::StreamSummary;

/// Capability names whose input carries a file path.
pub const FILE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "NotebookRead",
    "create_file",
    "edit_file",
    "read_file",
];

/// Capability names whose input carries a shell command.
pub const SHELL_TOOLS: &[&str] = &["Bash", "bash", "shell"];

/// Input keys checked, in order, for a file path.
pub const PATH_KEYS: &[&str] = &["file_path", "path", "notebook_path"];

/// Every `(name, input)` capability invocation found in assistant messages.
pub fn tool_invocations(messages: &[Value]) -> impl Iterator<Item = (&str, &Value)> + '_ {
    messages
        .iter()
        .filter(|m| m.get("type").and_then(Value::as_str) == Some("assistant"))
        .filter_map(|m| m.get("message")?.get("content")?.as_array())
        .flatten()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
        .filter_map(|block| {
            let name = block.get("name")?.as_str()?;
            Some((name, block.get("input").unwrap_or(&Value::Null)))
        })
}

/// Distinct file paths targeted by file-oriented capabilities, in first-seen order.
#[must_use]
pub fn files_touched(messages: &[Value]) -> Vec<String> {
    let mut files = Vec::new();
    for (name, input) in tool_invocations(messages) {
        if !FILE_TOOLS.contains(&name) {
            continue;
        }
        if let Some(path) = PATH_KEYS
            .iter()
            .find_map(|key| input.get(*key).and_then(Value::as_str))
        {
            push_unique(&mut files, path);
        }
    }
    files
}

/// Shell commands run, in order (duplicates kept).
#[must_use]
pub fn shell_commands(messages: &[Value]) -> Vec<String> {
    tool_invocations(messages)
        .filter(|(name, _)| SHELL_TOOLS.contains(name))
        .filter_map(|(_, input)| input.get("command").and_then(Value::as_str))
        .map(str::to_owned)
        .collect()
}

/// Summarize a captured message list.
#[must_use]
pub fn summarize(messages: &[Value]) -> StreamSummary {
    let mut tools = Vec::new();
    for (name, _) in tool_invocations(messages) {
        push_unique(&mut tools, name);
    }
    StreamSummary {
        message_count: messages.len(),
        tools,
        files_touched: files_touched(messages),
        commands: shell_commands(messages),
    }
}

fn push_unique(items: &mut Vec<String>, value: &str) {
    if !items.iter().any(|existing| existing == value) {
        items.push(value.to_owned());
    }
}
