//! Integration tests for the subprocess backend against fake executables.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay::backend::{AgentBackend, BackendRequest, CallbackFuture, Invocation, UpdateCallback};
use agent_relay::models::stream::UpdateKind;
use agent_relay::AppError;

use super::test_helpers::{emit_lines, fake_cli, fresh_request, recording_callback, subprocess_backend};

const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"abc123","tools":["Read","Bash"]}"#;
const ASSISTANT: &str = r#"{"type":"assistant","session_id":"abc123","message":{"content":[{"type":"text","text":"Reading."},{"type":"tool_use","id":"tu_1","name":"Read","input":{"file_path":"src/lib.rs"}}]}}"#;
const RESULT: &str = r#"{"type":"result","subtype":"success","result":"Done","session_id":"abc123","total_cost_usd":0.02,"duration_ms":900,"num_turns":2,"is_error":false}"#;

#[tokio::test]
async fn stream_is_parsed_into_updates_and_result() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exe = fake_cli(
        tmp.path(),
        &emit_lines(&[INIT, "not json at all", ASSISTANT, r#"{"no":"type"}"#, RESULT]),
    );
    let backend = subprocess_backend(exe, Duration::from_secs(10));
    let (callback, seen) = recording_callback();

    let result = backend
        .execute(&fresh_request(tmp.path(), "read lib"), Some(callback))
        .await
        .expect("execute");

    assert_eq!(result.content, "Done");
    assert_eq!(result.session_id, "abc123");
    assert_eq!(result.num_turns, 2);
    assert_eq!(result.duration_ms, 900);
    assert_eq!(result.tools_used.len(), 1);
    assert_eq!(result.tools_used[0].name, "Read");
    let summary = result.summary.expect("summary");
    assert_eq!(summary.files_touched, vec!["src/lib.rs"]);

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 2);
    assert!(matches!(seen[0].kind, UpdateKind::System { .. }));
    assert!(matches!(seen[1].kind, UpdateKind::Assistant { .. }));
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test]
async fn failing_callback_keeps_reading() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exe = fake_cli(tmp.path(), &emit_lines(&[INIT, ASSISTANT, RESULT]));
    let backend = subprocess_backend(exe, Duration::from_secs(10));
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    let callback: UpdateCallback = Arc::new(move |update| -> CallbackFuture {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            let mut kinds = sink.lock().expect("lock");
            kinds.push(update.kind_name().to_owned());
            if kinds.len() == 1 {
                return Err(AppError::Io("downstream closed".into()));
            }
            Ok(())
        })
    });

    let result = backend
        .execute(&fresh_request(tmp.path(), "hi"), Some(callback))
        .await
        .expect("callback failure is not fatal");

    assert_eq!(result.content, "Done");
    assert_eq!(*kinds.lock().expect("lock"), vec!["system", "assistant"]);
}

#[tokio::test]
async fn resume_arguments_reach_the_executable() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let args_file = tmp.path().join("args.txt");
    let body = format!(
        "printf '%s\\n' \"$@\" > '{}'\n{}",
        args_file.display(),
        emit_lines(&[RESULT])
    );
    let exe = fake_cli(tmp.path(), &body);
    let backend = subprocess_backend(exe, Duration::from_secs(10));

    let request = BackendRequest {
        prompt: "next step".into(),
        working_directory: tmp.path().to_path_buf(),
        invocation: Invocation::Resume {
            session_id: "abc123".into(),
        },
    };
    backend.execute(&request, None).await.expect("execute");

    let args = std::fs::read_to_string(&args_file).expect("args file");
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(&args[..4], &["--resume", "abc123", "-p", "next step"]);
    assert!(args.contains(&"stream-json"));
    assert!(args.contains(&"--max-turns"));
}

#[tokio::test]
async fn usage_limit_exit_is_classified() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exe = fake_cli(
        tmp.path(),
        "echo 'Claude AI usage limit reached. Your limit resets 2pm (UTC).' >&2\nexit 1",
    );
    let backend = subprocess_backend(exe, Duration::from_secs(10));

    let err = backend
        .execute(&fresh_request(tmp.path(), "hi"), None)
        .await
        .expect_err("throttled");
    match err {
        AppError::UsageLimit { reset_at, message } => {
            assert_eq!(reset_at.as_deref(), Some("2pm"));
            assert!(message.contains("2pm"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn other_failures_carry_exit_code_and_stderr() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exe = fake_cli(tmp.path(), "echo 'boom' >&2\nexit 3");
    let backend = subprocess_backend(exe, Duration::from_secs(10));

    let err = backend
        .execute(&fresh_request(tmp.path(), "hi"), None)
        .await
        .expect_err("fails");
    match err {
        AppError::Process { exit_code, stderr } => {
            assert_eq!(exit_code, Some(3));
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_result_is_parsing_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exe = fake_cli(tmp.path(), &emit_lines(&[INIT, ASSISTANT]));
    let backend = subprocess_backend(exe, Duration::from_secs(10));

    let err = backend
        .execute(&fresh_request(tmp.path(), "hi"), None)
        .await
        .expect_err("no result");
    assert!(matches!(err, AppError::Parsing(ref msg) if msg.contains("without a result")));
}

#[tokio::test]
async fn slow_backend_times_out() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exe = fake_cli(tmp.path(), "exec sleep 30");
    let backend = subprocess_backend(exe, Duration::from_millis(300));

    let started = std::time::Instant::now();
    let err = backend
        .execute(&fresh_request(tmp.path(), "hi"), None)
        .await
        .expect_err("times out");
    assert!(matches!(err, AppError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test]
async fn oversized_line_is_skipped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let long_line = format!(r#"{{"type":"assistant","message":{{"content":"{}"}}}}"#, "x".repeat(128 * 1024));
    let exe = fake_cli(tmp.path(), &emit_lines(&[&long_line, RESULT]));
    let backend = subprocess_backend(exe, Duration::from_secs(10));

    let result = backend
        .execute(&fresh_request(tmp.path(), "hi"), None)
        .await
        .expect("result after oversized line");
    assert_eq!(result.session_id, "abc123");
}

#[tokio::test]
async fn invalid_utf8_line_is_skipped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let body = format!("printf '\\377\\376 bad bytes\\n'\n{}", emit_lines(&[ASSISTANT, RESULT]));
    let exe = fake_cli(tmp.path(), &body);
    let backend = subprocess_backend(exe, Duration::from_secs(10));
    let (callback, seen) = recording_callback();

    let result = backend
        .execute(&fresh_request(tmp.path(), "hi"), Some(callback))
        .await
        .expect("result after invalid bytes");

    assert_eq!(result.session_id, "abc123");
    assert_eq!(result.content, "Done");
    assert_eq!(seen.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn shutdown_terminates_in_flight_calls() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let exe = fake_cli(tmp.path(), "exec sleep 30");
    let backend = Arc::new(subprocess_backend(exe, Duration::from_secs(60)));
    let request = fresh_request(tmp.path(), "hi");

    let task = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move { backend.execute(&request, None).await })
    };
    for _ in 0..100 {
        if backend.in_flight() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(backend.shutdown(), 1);

    let err = task.await.expect("join").expect_err("cancelled");
    assert!(matches!(err, AppError::Process { exit_code: None, ref stderr } if stderr.contains("shutdown")));
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test]
async fn missing_executable_is_process_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let backend = subprocess_backend(tmp.path().join("absent"), Duration::from_secs(5));

    let err = backend
        .execute(&fresh_request(tmp.path(), "hi"), None)
        .await
        .expect_err("spawn fails");
    assert!(matches!(err, AppError::Process { exit_code: None, .. }));
}
