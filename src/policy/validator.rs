//! Tool validator: accepts or rejects one capability invocation.
//!
//! Checks run in a fixed order and the first failure wins:
//! 1. allow-list membership (only when an allow-list is configured),
//! 2. deny-list membership (deny wins over allow),
//! 3. path confinement for file-oriented capabilities,
//! 4. dangerous-operator scan for shell capabilities.
//!
//! Rejections are returned, never raised; the gateway decides whether a
//! rejection is fatal.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info_span, warn};

use super::path_safety::PathConfinement;
use crate::models::validation::{
    RejectionReason, SecurityViolation, ToolCallAttempt, ValidationOutcome,
};
use crate::stream::summary::{FILE_TOOLS, PATH_KEYS, SHELL_TOOLS};

/// Substrings rejected in shell commands, scanned in order.
///
/// Multi-character operators precede their single-character prefixes so
/// the reported pattern is the most specific one.
pub const DANGEROUS_SUBSTRINGS: &[&str] = &[
    "$(", "`", "&&", "||", ";", "|", ">>", ">", "<", "&",
];

/// Privilege-escalation commands, matched as whole words.
pub const PRIVILEGE_COMMANDS: &[&str] = &["sudo", "su", "doas", "pkexec"];

/// Recorded violations kept for reporting; oldest are dropped first.
pub const MAX_VIOLATIONS: usize = 1000;

/// Aggregate view of recorded rejections.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SecuritySummary {
    /// Validations performed.
    pub total_validations: u64,
    /// Rejections currently retained.
    pub total_violations: usize,
    /// Retained rejections grouped by reason code.
    pub by_reason: BTreeMap<String, usize>,
    /// Retained rejections grouped by capability name.
    pub by_tool: BTreeMap<String, usize>,
    /// Retained rejections grouped by user.
    pub by_user: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct ValidatorState {
    usage: HashMap<String, u64>,
    violations: VecDeque<SecurityViolation>,
    total_validations: u64,
}

/// Validates capability invocations against the configured policy.
///
/// Owns its usage counters and violation log behind a mutex.
pub struct ToolValidator {
    allowed: Vec<String>,
    disallowed: Vec<String>,
    confinement: Arc<dyn PathConfinement>,
    state: Mutex<ValidatorState>,
}

impl std::fmt::Debug for ToolValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolValidator")
            .field("allowed", &self.allowed)
            .field("disallowed", &self.disallowed)
            .finish_non_exhaustive()
    }
}

impl ToolValidator {
    /// Create a validator. An empty `allowed` list means no allow-list.
    #[must_use]
    pub fn new(
        allowed: Vec<String>,
        disallowed: Vec<String>,
        confinement: Arc<dyn PathConfinement>,
    ) -> Self {
        Self {
            allowed,
            disallowed,
            confinement,
            state: Mutex::new(ValidatorState::default()),
        }
    }

    /// The configured allow-list.
    #[must_use]
    pub fn allowed_tools(&self) -> &[String] {
        &self.allowed
    }

    /// Validate one invocation.
    pub fn validate(&self, attempt: &ToolCallAttempt) -> ValidationOutcome {
        let _span = info_span!(
            "tool_validate",
            tool_name = %attempt.name,
            user_id = %attempt.user_id,
        )
        .entered();

        {
            let mut state = self.lock();
            state.total_validations += 1;
            *state.usage.entry(attempt.name.clone()).or_default() += 1;
        }

        match self.check(attempt) {
            None => {
                debug!("tool call allowed");
                ValidationOutcome::allow()
            }
            Some(reason) => {
                warn!(code = reason.code(), ?reason, "tool call rejected");
                self.record_violation(attempt, reason.clone());
                ValidationOutcome::reject(reason)
            }
        }
    }

    fn check(&self, attempt: &ToolCallAttempt) -> Option<RejectionReason> {
        let name = attempt.name.as_str();

        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| a == name) {
            return Some(RejectionReason::NotAllowListed);
        }

        if self.disallowed.iter().any(|d| d == name) {
            return Some(RejectionReason::DenyListed);
        }

        if FILE_TOOLS.contains(&name) {
            if let Some(path) = target_path(&attempt.input) {
                if let Err(err) = self.confinement.confine(path, &attempt.working_directory) {
                    return Some(RejectionReason::PathOutsideRoot {
                        path: path.to_owned(),
                        detail: err.to_string(),
                    });
                }
            }
        }

        if SHELL_TOOLS.contains(&name) {
            if let Some(command) = attempt.input.get("command").and_then(Value::as_str) {
                if let Some(pattern) = dangerous_pattern(command) {
                    return Some(RejectionReason::DangerousCommand {
                        pattern: pattern.to_owned(),
                    });
                }
            }
        }

        None
    }

    fn record_violation(&self, attempt: &ToolCallAttempt, reason: RejectionReason) {
        let mut state = self.lock();
        if state.violations.len() == MAX_VIOLATIONS {
            state.violations.pop_front();
        }
        state.violations.push_back(SecurityViolation {
            timestamp: Utc::now(),
            user_id: attempt.user_id.clone(),
            tool_name: attempt.name.clone(),
            working_directory: attempt.working_directory.clone(),
            reason,
        });
    }

    /// Per-name invocation counters.
    #[must_use]
    pub fn usage_stats(&self) -> BTreeMap<String, u64> {
        self.lock()
            .usage
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect()
    }

    /// Retained rejections, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<SecurityViolation> {
        self.lock().violations.iter().cloned().collect()
    }

    /// Totals over the retained rejections.
    #[must_use]
    pub fn security_summary(&self) -> SecuritySummary {
        let state = self.lock();
        let mut summary = SecuritySummary {
            total_validations: state.total_validations,
            total_violations: state.violations.len(),
            ..SecuritySummary::default()
        };
        for violation in &state.violations {
            *summary
                .by_reason
                .entry(violation.reason.code().to_owned())
                .or_default() += 1;
            *summary.by_tool.entry(violation.tool_name.clone()).or_default() += 1;
            *summary.by_user.entry(violation.user_id.clone()).or_default() += 1;
        }
        summary
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ValidatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// File path named by a capability input, probing [`PATH_KEYS`] in order.
#[must_use]
pub fn target_path(input: &Value) -> Option<&str> {
    PATH_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
}

/// First dangerous pattern found in `command`, if any.
#[must_use]
pub fn dangerous_pattern(command: &str) -> Option<&'static str> {
    if let Some(pattern) = DANGEROUS_SUBSTRINGS
        .iter()
        .find(|pattern| command.contains(**pattern))
    {
        return Some(*pattern);
    }
    command
        .split_whitespace()
        .find_map(|word| PRIVILEGE_COMMANDS.iter().find(|cmd| **cmd == word))
        .copied()
}

/// Convenience for building an attempt from stream data.
#[must_use]
pub fn attempt(name: &str, input: &Value, working_directory: &Path, user_id: &str) -> ToolCallAttempt {
    ToolCallAttempt {
        name: name.to_owned(),
        input: input.clone(),
        working_directory: working_directory.to_path_buf(),
        user_id: user_id.to_owned(),
    }
}
