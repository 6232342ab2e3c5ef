//! Capability-call validation model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A capability invocation presented for validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallAttempt {
    /// Capability name.
    pub name: String,
    /// Input parameters.
    pub input: serde_json::Value,
    /// Directory the backend runs in.
    pub working_directory: PathBuf,
    /// Requesting user.
    pub user_id: String,
}

/// Structured reason for a rejection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    /// An allow-list is configured and the name is not on it.
    NotAllowListed,
    /// The name is on the deny-list.
    DenyListed,
    /// A file-oriented call targets a path outside the approved root.
    PathOutsideRoot {
        /// Offending path.
        path: String,
        /// Confinement check detail.
        detail: String,
    },
    /// A shell call contains a dangerous operator or command.
    DangerousCommand {
        /// The matched pattern.
        pattern: String,
    },
}

impl RejectionReason {
    /// Short machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAllowListed => "not_allow_listed",
            Self::DenyListed => "deny_listed",
            Self::PathOutsideRoot { .. } => "path_outside_root",
            Self::DangerousCommand { .. } => "dangerous_command",
        }
    }
}

/// Outcome of validating one capability invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// Whether the invocation may proceed.
    pub allowed: bool,
    /// Rejection reason when not allowed.
    pub reason: Option<RejectionReason>,
    /// Every name blocked so far in the surrounding execution, filled in
    /// by the caller that tracks the execution.
    pub blocked: Vec<String>,
}

impl ValidationOutcome {
    /// An allowing outcome.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            blocked: Vec::new(),
        }
    }

    /// A rejecting outcome with the given reason.
    #[must_use]
    pub fn reject(reason: RejectionReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            blocked: Vec::new(),
        }
    }

    /// Attach the execution's accumulated blocked names.
    #[must_use]
    pub fn with_blocked(mut self, blocked: Vec<String>) -> Self {
        self.blocked = blocked;
        self
    }
}

/// Recorded rejection, retained for security reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityViolation {
    /// When the rejection happened.
    pub timestamp: DateTime<Utc>,
    /// Requesting user.
    pub user_id: String,
    /// Rejected capability name.
    pub tool_name: String,
    /// Directory the backend was running in.
    pub working_directory: PathBuf,
    /// Structured reason.
    pub reason: RejectionReason,
}
