//! Unit tests for post-hoc stream summarization.

use serde_json::{json, Value};

use agent_relay::stream::summary::{files_touched, shell_commands, summarize};

fn assistant(blocks: Value) -> Value {
    json!({"type": "assistant", "message": {"content": blocks}})
}

fn sample() -> Vec<Value> {
    vec![
        json!({"type": "system", "subtype": "init"}),
        assistant(json!([
            {"type": "text", "text": "reading"},
            {"type": "tool_use", "name": "Read", "input": {"file_path": "src/lib.rs"}},
            {"type": "tool_use", "name": "Bash", "input": {"command": "cargo fmt"}}
        ])),
        assistant(json!([
            {"type": "tool_use", "name": "Edit", "input": {"file_path": "src/lib.rs"}},
            {"type": "tool_use", "name": "NotebookEdit", "input": {"notebook_path": "nb.ipynb"}},
            {"type": "tool_use", "name": "Bash", "input": {"command": "cargo fmt"}}
        ])),
        json!({"type": "user", "message": {"content": [{"type": "tool_use", "name": "Write", "input": {"file_path": "ignored.rs"}}]}}),
    ]
}

#[test]
fn files_touched_are_unique_in_first_seen_order() {
    assert_eq!(files_touched(&sample()), vec!["src/lib.rs", "nb.ipynb"]);
}

#[test]
fn shell_commands_keep_duplicates() {
    assert_eq!(shell_commands(&sample()), vec!["cargo fmt", "cargo fmt"]);
}

#[test]
fn summarize_collects_distinct_tools() {
    let summary = summarize(&sample());
    assert_eq!(summary.message_count, 4);
    assert_eq!(summary.tools, vec!["Read", "Bash", "Edit", "NotebookEdit"]);
    assert_eq!(summary.files_touched.len(), 2);
    assert_eq!(summary.commands.len(), 2);
}

#[test]
fn summarize_empty_buffer() {
    let summary = summarize(&[]);
    assert_eq!(summary.message_count, 0);
    assert!(summary.tools.is_empty());
}
