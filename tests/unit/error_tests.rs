//! Unit tests for error display and user-facing messages.

use agent_relay::errors::{tool_remediation, SdkError};
use agent_relay::AppError;

#[test]
fn display_prefixes_identify_the_category() {
    assert_eq!(AppError::Parsing("bad".into()).to_string(), "parsing: bad");
    assert_eq!(
        AppError::Timeout { seconds: 30 }.to_string(),
        "timeout: execution exceeded 30s"
    );
    assert_eq!(
        AppError::Process {
            exit_code: Some(2),
            stderr: "boom".into()
        }
        .to_string(),
        "process: exited with code 2: boom"
    );
    assert!(AppError::Unauthorized("x".into()).to_string().starts_with("unauthorized:"));
}

#[test]
fn display_has_no_trailing_period() {
    let err = AppError::Db("write failed".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn only_tool_validation_aborts_streams() {
    let abort = AppError::ToolValidation {
        blocked: vec!["Write".into()],
        allowed: vec![],
    };
    assert!(abort.aborts_stream());
    assert!(!AppError::Io("x".into()).aborts_stream());
    assert!(!AppError::Parsing("x".into()).aborts_stream());
}

#[test]
fn user_message_never_leaks_internal_text() {
    let err = AppError::Db("UNIQUE constraint failed: session.id".into());
    let message = err.user_message();
    assert!(!message.contains("UNIQUE"));
    assert!(message.contains("internal error"));
}

#[test]
fn timeout_message_names_the_budget() {
    let message = AppError::Timeout { seconds: 300 }.user_message();
    assert!(message.contains("300s"));
}

#[test]
fn usage_limit_message_passes_through() {
    let err = AppError::UsageLimit {
        reset_at: Some("2pm".into()),
        message: "Usage limit reached. Your limit resets at 2pm.".into(),
    };
    assert!(err.user_message().contains("2pm"));
}

#[test]
fn tool_validation_message_lists_blocked_and_allowed() {
    let err = AppError::ToolValidation {
        blocked: vec!["Bash".into(), "Write".into()],
        allowed: vec!["Read".into()],
    };
    let message = err.user_message();
    assert!(message.contains("Bash, Write"));
    assert!(message.contains("Currently allowed tools: Read"));
}

#[test]
fn remediation_without_allow_list() {
    let text = tool_remediation(&["Bash".into()], &[]);
    assert!(text.contains("(no allow-list configured)"));
}

#[test]
fn grouped_sdk_error_surfaces_not_found_remediation() {
    let err = AppError::Sdk(SdkError::Grouped(vec![
        SdkError::Client("cancelled".into()),
        SdkError::ExecutableNotFound {
            remediation: "install the CLI".into(),
        },
    ]));
    assert_eq!(err.user_message(), "install the CLI");
}

#[test]
fn sdk_retryability() {
    assert!(SdkError::MalformedStream("x".into()).is_retryable());
    assert!(SdkError::Grouped(vec![]).is_retryable());
    assert!(SdkError::Client("Unknown message type: rate_limit_event".into()).is_retryable());
    assert!(SdkError::Client("Failed to decode JSON: eof".into()).is_retryable());
    assert!(!SdkError::Client("unknown message type".into()).is_retryable());
    assert!(!SdkError::Connection("refused".into()).is_retryable());
    assert!(!SdkError::Process {
        exit_code: Some(1),
        stderr: String::new()
    }
    .is_retryable());
}

#[test]
fn most_relevant_prefers_process_over_client() {
    let grouped = SdkError::Grouped(vec![
        SdkError::Client("a".into()),
        SdkError::Process {
            exit_code: Some(1),
            stderr: "crash".into(),
        },
        SdkError::MalformedStream("b".into()),
    ]);
    assert!(matches!(grouped.most_relevant(), SdkError::Process { .. }));
    assert!(grouped.to_string().ends_with("(+2 grouped)"));
}

#[test]
fn empty_group_is_its_own_most_relevant() {
    let grouped = SdkError::Grouped(vec![]);
    assert!(std::ptr::eq(grouped.most_relevant(), &grouped));
    assert_eq!(grouped.to_string(), "grouped failure with no causes");
}
