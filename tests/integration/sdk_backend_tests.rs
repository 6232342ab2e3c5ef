//! Integration tests for the SDK backend and client-level fallback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agent_relay::backend::sdk::{CliAgentClient, SdkBackend, SdkConfig};
use agent_relay::backend::AgentBackend;
use agent_relay::errors::SdkError;
use agent_relay::AppError;

use super::test_helpers::{fresh_request, recording_callback, sdk_message, ScriptedClient};

fn sdk_config(timeout: Duration) -> SdkConfig {
    SdkConfig {
        max_turns: 5,
        allowed_tools: Vec::new(),
        timeout,
        max_buffered_messages: 100,
    }
}

fn backend(client: ScriptedClient) -> SdkBackend {
    SdkBackend::new(Arc::new(client), sdk_config(Duration::from_secs(5)))
}

fn assistant_with_tool() -> serde_json::Value {
    json!({
        "type": "assistant",
        "session_id": "abc123",
        "message": {"content": [
            {"type": "text", "text": "Running."},
            {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "cargo check"}}
        ]}
    })
}

fn result_message() -> serde_json::Value {
    json!({"type": "result", "subtype": "success", "result": "ok", "session_id": "abc123", "num_turns": 1})
}

#[tokio::test]
async fn messages_normalize_to_shared_updates() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::new(vec![
        Ok(sdk_message(json!({"type": "system", "subtype": "init", "tools": ["Bash"]}))),
        Ok(sdk_message(assistant_with_tool())),
        Ok(sdk_message(result_message())),
    ]);
    let (callback, seen) = recording_callback();

    let result = backend(client)
        .execute(&fresh_request(tmp.path(), "check"), Some(callback))
        .await
        .expect("execute");

    assert_eq!(result.session_id, "abc123");
    assert_eq!(result.content, "ok");
    assert_eq!(result.tools_used.len(), 1);
    assert_eq!(result.tools_used[0].name, "Bash");
    let summary = result.summary.expect("summary");
    assert_eq!(summary.commands, vec!["cargo check"]);
    assert_eq!(seen.lock().expect("lock").len(), 2);
}

#[tokio::test]
async fn single_stream_failure_surfaces_as_sdk_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::new(vec![
        Ok(sdk_message(assistant_with_tool())),
        Err(SdkError::MalformedStream("Unknown message type: rate_limit_event".into())),
        Ok(sdk_message(result_message())),
    ]);

    let err = backend(client)
        .execute(&fresh_request(tmp.path(), "check"), None)
        .await
        .expect_err("malformed");
    assert!(matches!(err, AppError::Sdk(SdkError::MalformedStream(_))));
}

#[tokio::test]
async fn multiple_failures_are_grouped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::new(vec![
        Err(SdkError::Client("cancelled".into())),
        Err(SdkError::Process {
            exit_code: Some(1),
            stderr: "crashed".into(),
        }),
    ]);

    let err = backend(client)
        .execute(&fresh_request(tmp.path(), "check"), None)
        .await
        .expect_err("grouped");
    match err {
        AppError::Sdk(grouped @ SdkError::Grouped(_)) => {
            assert!(matches!(grouped.most_relevant(), SdkError::Process { .. }));
            assert!(grouped.is_retryable());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn stream_without_result_is_parsing_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::new(vec![Ok(sdk_message(assistant_with_tool()))]);

    let err = backend(client)
        .execute(&fresh_request(tmp.path(), "check"), None)
        .await
        .expect_err("no result");
    assert!(matches!(err, AppError::Parsing(_)));
}

#[tokio::test]
async fn hanging_client_times_out() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::hanging(vec![Ok(sdk_message(assistant_with_tool()))]);
    let backend = SdkBackend::new(Arc::new(client), sdk_config(Duration::from_millis(200)));

    let err = backend
        .execute(&fresh_request(tmp.path(), "check"), None)
        .await
        .expect_err("timeout");
    assert!(matches!(err, AppError::Timeout { .. }));
}

#[tokio::test]
async fn shutdown_cancels_hanging_call() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let client = ScriptedClient::hanging(Vec::new());
    let backend = Arc::new(SdkBackend::new(
        Arc::new(client),
        sdk_config(Duration::from_secs(60)),
    ));
    let request = fresh_request(tmp.path(), "check");

    let task = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move { backend.execute(&request, None).await })
    };
    let mut signalled = 0;
    for _ in 0..100 {
        signalled = backend.shutdown();
        if signalled > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(signalled, 1);

    let err = task.await.expect("join").expect_err("cancelled");
    assert!(matches!(err, AppError::Process { exit_code: None, .. }));
}

#[tokio::test]
async fn missing_executable_reports_remediation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let client = CliAgentClient::new(PathBuf::from("/nonexistent/bin/claude"));
    let backend = SdkBackend::new(Arc::new(client), sdk_config(Duration::from_secs(5)));

    let err = backend
        .execute(&fresh_request(tmp.path(), "check"), None)
        .await
        .expect_err("not found");
    assert!(matches!(err, AppError::Sdk(SdkError::ExecutableNotFound { .. })));
    assert!(err.user_message().contains("npm install"));
}

#[cfg(unix)]
mod with_fake_cli {
    use super::*;
    use agent_relay::backend::subprocess::SubprocessBackend;
    use agent_relay::orchestrator::fallback::execute_with_fallback;

    use super::super::test_helpers::{emit_lines, fake_cli, subprocess_backend};

    const UNKNOWN: &str = r#"{"type":"rate_limit_event","session_id":"abc123"}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","result":"Recovered","session_id":"abc123","num_turns":1}"#;

    #[tokio::test]
    async fn cli_client_decodes_strictly() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exe = fake_cli(tmp.path(), &emit_lines(&[UNKNOWN, RESULT]));
        let backend = SdkBackend::new(
            Arc::new(CliAgentClient::new(exe)),
            sdk_config(Duration::from_secs(10)),
        );

        let err = backend
            .execute(&fresh_request(tmp.path(), "hi"), None)
            .await
            .expect_err("strict decode");
        assert!(matches!(err, AppError::Sdk(SdkError::MalformedStream(ref msg)) if msg.contains("rate_limit_event")));
    }

    #[tokio::test]
    async fn cli_client_reports_failed_exit() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exe = fake_cli(tmp.path(), "echo 'auth failed' >&2\nexit 2");
        let backend = SdkBackend::new(
            Arc::new(CliAgentClient::new(exe)),
            sdk_config(Duration::from_secs(10)),
        );

        let err = backend
            .execute(&fresh_request(tmp.path(), "hi"), None)
            .await
            .expect_err("exit failure");
        match err {
            AppError::Sdk(SdkError::Process { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, "auth failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cli_client_keeps_undecodable_stderr() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exe = fake_cli(tmp.path(), "printf 'auth \\377 failed\\n' >&2\nexit 2");
        let backend = SdkBackend::new(
            Arc::new(CliAgentClient::new(exe)),
            sdk_config(Duration::from_secs(10)),
        );

        let err = backend
            .execute(&fresh_request(tmp.path(), "hi"), None)
            .await
            .expect_err("exit failure");
        match err {
            AppError::Sdk(SdkError::Process { stderr, .. }) => {
                assert!(stderr.starts_with("auth "));
                assert!(stderr.ends_with(" failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cli_client_reports_invalid_utf8_as_malformed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let body = format!("printf '\\377\\376 bad bytes\\n'\n{}", emit_lines(&[RESULT]));
        let exe = fake_cli(tmp.path(), &body);
        let backend = SdkBackend::new(
            Arc::new(CliAgentClient::new(exe)),
            sdk_config(Duration::from_secs(10)),
        );

        let err = backend
            .execute(&fresh_request(tmp.path(), "hi"), None)
            .await
            .expect_err("strict decode");
        assert!(matches!(err, AppError::Sdk(SdkError::MalformedStream(_))));
        assert!(agent_relay::orchestrator::fallback::is_retryable(&err));
    }

    #[tokio::test]
    async fn subprocess_fallback_recovers_from_strict_decode() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exe = fake_cli(tmp.path(), &emit_lines(&[UNKNOWN, RESULT]));
        let sdk = SdkBackend::new(
            Arc::new(CliAgentClient::new(exe.clone())),
            sdk_config(Duration::from_secs(10)),
        );
        let subprocess: SubprocessBackend = subprocess_backend(exe, Duration::from_secs(10));

        let result = execute_with_fallback(
            &sdk,
            Some(&subprocess as &dyn AgentBackend),
            &fresh_request(tmp.path(), "hi"),
            |_| None,
        )
        .await
        .expect("fallback succeeds");
        assert_eq!(result.content, "Recovered");
        assert_eq!(result.session_id, "abc123");
    }
}
