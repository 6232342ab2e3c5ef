//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to touch the requested session.
    Unauthorized(String),
    /// File system path failed validation against the approved root.
    PathViolation(String),
    /// The execution exceeded its wall-clock budget.
    Timeout {
        /// Budget that was exceeded, in seconds.
        seconds: u64,
    },
    /// The backend process exited non-zero or its transport failed.
    Process {
        /// Exit code, when the process exited normally.
        exit_code: Option<i32>,
        /// Captured error output.
        stderr: String,
    },
    /// The backend stream could not be interpreted.
    Parsing(String),
    /// One or more capability invocations were blocked by policy.
    ToolValidation {
        /// Every name blocked during the run so far, in order.
        blocked: Vec<String>,
        /// Names currently permitted, for remediation text.
        allowed: Vec<String>,
    },
    /// The provider throttled the account.
    UsageLimit {
        /// Human reset-time token parsed from the failure output.
        reset_at: Option<String>,
        /// User-facing message, includes `reset_at` verbatim.
        message: String,
    },
    /// In-process client failure.
    Sdk(SdkError),
}

impl AppError {
    /// Whether this error must stop the stream it was raised from.
    ///
    /// Stream callbacks returning any other error are logged and skipped.
    #[must_use]
    pub fn aborts_stream(&self) -> bool {
        matches!(self, Self::ToolValidation { .. })
    }

    /// Render a templated, actionable message for end users.
    ///
    /// Raw internal error text is never returned on its own.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout { seconds } => format!(
                "The request timed out after {seconds}s. Try breaking the task into smaller steps."
            ),
            Self::Process { exit_code, .. } => {
                let code = exit_code.map_or_else(|| "unknown".to_owned(), |c| c.to_string());
                format!(
                    "The coding backend exited unexpectedly (exit code {code}). \
                     Try again, or start a new session."
                )
            }
            Self::Parsing(_) => {
                "The coding backend returned a response that could not be read. Please try again."
                    .to_owned()
            }
            Self::ToolValidation { blocked, allowed } => tool_remediation(blocked, allowed),
            Self::UsageLimit { message, .. } => message.clone(),
            Self::Sdk(err) => match err.most_relevant() {
                SdkError::ExecutableNotFound { remediation } => remediation.clone(),
                _ => "The coding backend client failed. Please try again in a moment.".to_owned(),
            },
            Self::NotFound(_) => "No matching session was found. Start a new one.".to_owned(),
            Self::Unauthorized(_) => "That session belongs to another user.".to_owned(),
            Self::PathViolation(_) => {
                "That path is outside the approved directory.".to_owned()
            }
            Self::Config(_) | Self::Db(_) | Self::Io(_) => {
                "An internal error occurred. Please contact the administrator.".to_owned()
            }
        }
    }
}

/// Build the remediation text shown when invocations were blocked.
#[must_use]
pub fn tool_remediation(blocked: &[String], allowed: &[String]) -> String {
    let allowed_text = if allowed.is_empty() {
        "(no allow-list configured)".to_owned()
    } else {
        allowed.join(", ")
    };
    format!(
        "Tool access blocked: {}.\n\nCurrently allowed tools: {allowed_text}.\n\n\
         Ask an administrator to update the tool allow-list, or rephrase the \
         request so it does not need the blocked tools.",
        blocked.join(", ")
    )
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Timeout { seconds } => write!(f, "timeout: execution exceeded {seconds}s"),
            Self::Process { exit_code, stderr } => match exit_code {
                Some(code) => write!(f, "process: exited with code {code}: {stderr}"),
                None => write!(f, "process: {stderr}"),
            },
            Self::Parsing(msg) => write!(f, "parsing: {msg}"),
            Self::ToolValidation { blocked, .. } => {
                write!(f, "tool validation: blocked {}", blocked.join(", "))
            }
            Self::UsageLimit { message, .. } => write!(f, "usage limit: {message}"),
            Self::Sdk(err) => write!(f, "sdk: {err}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parsing(err.to_string())
    }
}

impl From<SdkError> for AppError {
    fn from(err: SdkError) -> Self {
        Self::Sdk(err)
    }
}

// ── In-process client errors ─────────────────────────────────────────────────

/// Message fragments that mark a client failure as a malformed-stream or
/// grouped internal failure, eligible for one retry via the subprocess path.
///
/// Matched case-sensitively against [`SdkError::Client`] messages.
pub const RETRYABLE_MESSAGE_MARKERS: &[&str] = &[
    "unhandled errors in a TaskGroup",
    "Unknown message type",
    "Failed to decode JSON",
];

/// Failure categories raised by the in-process client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    /// The backend executable could not be located on the host.
    ExecutableNotFound {
        /// Actionable install/configuration instructions.
        remediation: String,
    },
    /// The backend process exited with a failure.
    Process {
        /// Exit code, when available.
        exit_code: Option<i32>,
        /// Captured error output.
        stderr: String,
    },
    /// The client could not reach or talk to the backend.
    Connection(String),
    /// A message on the stream could not be decoded.
    MalformedStream(String),
    /// Any other client failure.
    Client(String),
    /// Several failures raised together by concurrent client tasks.
    Grouped(Vec<SdkError>),
}

impl SdkError {
    /// Whether this failure warrants one retry through the subprocess backend.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MalformedStream(_) | Self::Grouped(_) => true,
            Self::Client(msg) => RETRYABLE_MESSAGE_MARKERS
                .iter()
                .any(|marker| msg.contains(marker)),
            Self::ExecutableNotFound { .. } | Self::Process { .. } | Self::Connection(_) => false,
        }
    }

    /// Surface the most relevant nested cause of a grouped failure.
    ///
    /// Non-grouped errors return themselves. Within a group the cause with
    /// the highest [`Self::relevance`] wins; ties keep the earliest cause.
    #[must_use]
    pub fn most_relevant(&self) -> &Self {
        match self {
            Self::Grouped(causes) => causes
                .iter()
                .map(Self::most_relevant)
                .fold(None::<&Self>, |best, candidate| match best {
                    Some(current) if current.relevance() >= candidate.relevance() => {
                        Some(current)
                    }
                    _ => Some(candidate),
                })
                .unwrap_or(self),
            other => other,
        }
    }

    fn relevance(&self) -> u8 {
        match self {
            Self::ExecutableNotFound { .. } => 5,
            Self::Process { .. } => 4,
            Self::Connection(_) => 3,
            Self::MalformedStream(_) => 2,
            Self::Client(_) => 1,
            Self::Grouped(_) => 0,
        }
    }
}

impl Display for SdkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutableNotFound { remediation } => {
                write!(f, "backend executable not found: {remediation}")
            }
            Self::Process { exit_code, stderr } => match exit_code {
                Some(code) => write!(f, "backend process failed with code {code}: {stderr}"),
                None => write!(f, "backend process failed: {stderr}"),
            },
            Self::Connection(msg) => write!(f, "connection failed: {msg}"),
            Self::MalformedStream(msg) => write!(f, "malformed stream: {msg}"),
            Self::Client(msg) => write!(f, "client error: {msg}"),
            Self::Grouped(causes) => {
                let primary = self.most_relevant();
                if std::ptr::eq(primary, self) {
                    write!(f, "grouped failure with no causes")
                } else {
                    write!(f, "{primary} (+{} grouped)", causes.len().saturating_sub(1))
                }
            }
        }
    }
}

impl std::error::Error for SdkError {}
