//! Unit tests for typed client message decoding.

use serde_json::json;

use agent_relay::backend::sdk::SdkMessage;
use agent_relay::errors::SdkError;
use agent_relay::models::stream::UpdateKind;
use agent_relay::stream::parser::ParsedLine;

#[test]
fn assistant_message_normalizes_to_update() {
    let line = json!({
        "type": "assistant",
        "session_id": "abc123",
        "message": {"content": [
            {"type": "text", "text": "hi"},
            {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "a.rs"}}
        ]}
    })
    .to_string();

    let message = SdkMessage::parse(&line).expect("decode");
    assert!(matches!(message, SdkMessage::Assistant(_)));
    let ParsedLine::Update(update) = message.normalize() else {
        panic!("expected update");
    };
    assert_eq!(update.session_id.as_deref(), Some("abc123"));
    assert_eq!(update.tool_calls().len(), 1);
}

#[test]
fn system_init_keeps_extra_fields() {
    let line = json!({"type": "system", "subtype": "init", "tools": ["Bash"], "model": "m"}).to_string();
    let ParsedLine::Update(update) = SdkMessage::parse(&line).expect("decode").normalize() else {
        panic!("expected update");
    };
    match update.kind {
        UpdateKind::System { init: Some(init), .. } => {
            assert_eq!(init.tools, vec!["Bash"]);
            assert_eq!(init.model.as_deref(), Some("m"));
        }
        other => panic!("unexpected kind: {other:?}"),
    }
}

#[test]
fn result_message_normalizes_to_result() {
    let line = json!({"type": "result", "result": "done", "session_id": "s1", "num_turns": 2}).to_string();
    let ParsedLine::Result(result) = SdkMessage::parse(&line).expect("decode").normalize() else {
        panic!("expected result");
    };
    assert_eq!(result.content, "done");
    assert_eq!(result.session_id, "s1");
    assert_eq!(result.num_turns, 2);
}

#[test]
fn unknown_type_is_malformed_stream() {
    let err = SdkMessage::parse(r#"{"type":"rate_limit_event"}"#).expect_err("strict");
    assert_eq!(
        err,
        SdkError::MalformedStream("Unknown message type: rate_limit_event".into())
    );
    assert!(err.is_retryable());
}

#[test]
fn missing_type_is_malformed_stream() {
    let err = SdkMessage::parse(r#"{"message":{}}"#).expect_err("strict");
    assert!(matches!(err, SdkError::MalformedStream(ref msg) if msg.contains("missing type field")));
}

#[test]
fn invalid_json_is_decode_failure() {
    let err = SdkMessage::parse("{oops").expect_err("strict");
    assert!(matches!(err, SdkError::MalformedStream(ref msg) if msg.starts_with("Failed to decode JSON")));
}
