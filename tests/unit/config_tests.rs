use agent_relay::config::{GlobalConfig, API_KEY_ENV};
use agent_relay::AppError;

fn minimal_toml(root: &str) -> String {
    format!("approved_directory = '{root}'\n")
}

fn full_toml(root: &str, db: &str) -> String {
    format!(
        r#"
approved_directory = '{root}'
database_path = '{db}'

[backend]
cli_path = "/opt/bin/claude"
use_sdk = true
max_turns = 20
timeout_seconds = 60
max_buffered_messages = 50
read_chunk_bytes = 4096
max_line_bytes = 65536

[tools]
allowed = ["Read", "Write", "Bash"]
disallowed = ["WebFetch"]
critical = ["Write"]

[sessions]
timeout_hours = 12
max_per_user = 3
sweep_interval_seconds = 60
"#
    )
}

#[test]
fn minimal_config_applies_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::from_toml_str(&minimal_toml(&tmp.path().to_string_lossy()))
        .expect("valid config");

    assert_eq!(
        config.approved_directory,
        tmp.path().canonicalize().expect("canonical")
    );
    assert!(!config.backend.use_sdk);
    assert!(config.backend.cli_path.is_none());
    assert_eq!(config.backend.max_turns, 10);
    assert_eq!(config.backend.timeout_seconds, 300);
    assert_eq!(config.backend.max_buffered_messages, 1000);
    assert!(config.tools.allowed.is_empty());
    assert_eq!(
        config.tools.critical,
        vec!["Task", "Read", "Write", "Edit", "MultiEdit"]
    );
    assert_eq!(config.sessions.timeout_hours, 24);
    assert_eq!(config.sessions.max_per_user, 5);
    assert!(config.database_path.is_none());
    assert!(config.api_key.is_none());
}

#[test]
fn full_config_parses_every_section() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = tmp.path().join("sessions.db");
    let config = GlobalConfig::from_toml_str(&full_toml(
        &tmp.path().to_string_lossy(),
        &db.to_string_lossy(),
    ))
    .expect("valid config");

    assert!(config.backend.use_sdk);
    assert_eq!(config.backend.max_turns, 20);
    assert_eq!(config.backend.timeout().as_secs(), 60);
    assert_eq!(config.backend.max_line_bytes, 65536);
    assert_eq!(config.tools.allowed, vec!["Read", "Write", "Bash"]);
    assert_eq!(config.tools.disallowed, vec!["WebFetch"]);
    assert_eq!(config.tools.critical, vec!["Write"]);
    assert_eq!(config.sessions.max_per_user, 3);
    assert_eq!(config.database_path.as_deref(), Some(db.as_path()));
}

#[test]
fn missing_approved_directory_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let missing = tmp.path().join("missing");
    let err = GlobalConfig::from_toml_str(&minimal_toml(&missing.to_string_lossy()))
        .expect_err("must fail");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("approved_directory")));
}

#[test]
fn zero_max_turns_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "{}\n[backend]\nmax_turns = 0\n",
        minimal_toml(&tmp.path().to_string_lossy())
    );
    let err = GlobalConfig::from_toml_str(&raw).expect_err("must fail");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("max_turns")));
}

#[test]
fn zero_session_cap_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "{}\n[sessions]\nmax_per_user = 0\n",
        minimal_toml(&tmp.path().to_string_lossy())
    );
    assert!(GlobalConfig::from_toml_str(&raw).is_err());
}

#[test]
fn invalid_toml_is_config_error() {
    let err = GlobalConfig::from_toml_str("approved_directory = [").expect_err("must fail");
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("invalid config")));
}

#[test]
fn api_key_is_never_read_from_toml() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "{}api_key = \"sk-secret\"\n",
        minimal_toml(&tmp.path().to_string_lossy())
    );
    let config = GlobalConfig::from_toml_str(&raw).expect("valid config");
    assert!(config.api_key.is_none());
}

#[test]
fn backend_env_carries_api_key() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig::from_toml_str(&minimal_toml(&tmp.path().to_string_lossy()))
        .expect("valid config");
    assert!(config.backend_env().is_empty());

    config.api_key = Some("sk-test".into());
    assert_eq!(
        config.backend_env(),
        vec![(API_KEY_ENV.to_owned(), "sk-test".to_owned())]
    );
}

#[test]
fn load_from_missing_file_is_config_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(tmp.path().join("absent.toml")).expect_err("must fail");
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("failed to read config")));
}
