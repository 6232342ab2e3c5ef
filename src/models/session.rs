//! Session model and lifecycle helpers.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::ExecutionResult;

/// Prefix carried by every locally generated placeholder id.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Lifecycle status for a session.
///
/// `New` → `Active` happens exactly once, at the first successful
/// execution. `Expired` is terminal; expired sessions leave the hot set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Placeholder id, not yet confirmed by the backend.
    New,
    /// Backend-confirmed id, resident in the hot set.
    Active,
    /// Evicted by timeout sweep, explicit end, or per-user LRU cap.
    Expired,
}

impl SessionStatus {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Active | Self::Expired) | (Self::Active, Self::Expired)
        )
    }
}

/// Unit of continuity across prompts for one user in one directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Temporary placeholder or backend-confirmed identifier.
    pub id: String,
    /// Owning user; immutable after creation.
    pub user_id: String,
    /// Directory the backend runs in.
    pub working_directory: PathBuf,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last completed execution (or creation) timestamp.
    pub last_used: DateTime<Utc>,
    /// Accumulated cost in USD.
    pub total_cost: f64,
    /// Accumulated backend turns.
    pub total_turns: u32,
    /// Number of completed executions.
    pub message_count: u32,
    /// Distinct capability names used across executions.
    pub tools_used: BTreeSet<String>,
    /// `true` until the backend confirms the id.
    pub is_new: bool,
}

impl Session {
    /// Construct a new unconfirmed session with a placeholder id.
    #[must_use]
    pub fn new(user_id: String, working_directory: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: temporary_id(),
            user_id,
            working_directory,
            created_at: now,
            last_used: now,
            total_cost: 0.0,
            total_turns: 0,
            message_count: 0,
            tools_used: BTreeSet::new(),
            is_new: true,
        }
    }

    /// Whether the id is still a local placeholder, i.e. not yet confirmed.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.is_new
    }

    /// Confirm the session under the backend-assigned id.
    ///
    /// Returns `false` and leaves the session untouched when it is no
    /// longer allowed to become `Active`.
    pub fn confirm(&mut self, backend_id: &str) -> bool {
        if !self.status().can_transition_to(SessionStatus::Active) {
            return false;
        }
        self.id = backend_id.to_owned();
        self.is_new = false;
        true
    }

    /// Current lifecycle status as seen from the hot set.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        if self.is_new {
            SessionStatus::New
        } else {
            SessionStatus::Active
        }
    }

    /// Whether the session has been idle for longer than `timeout_hours`.
    #[must_use]
    pub fn is_expired(&self, timeout_hours: u64, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_used).num_seconds();
        u64::try_from(idle).is_ok_and(|secs| secs > timeout_hours.saturating_mul(3600))
    }

    /// Fold one completed execution into the accumulated counters.
    pub fn record(&mut self, result: &ExecutionResult) {
        self.message_count = self.message_count.saturating_add(1);
        self.total_turns = self.total_turns.saturating_add(result.num_turns);
        self.total_cost += result.cost;
        self.last_used = Utc::now();
        self.tools_used
            .extend(result.tools_used.iter().map(|t| t.name.clone()));
    }
}

/// Generate a fresh placeholder id.
#[must_use]
pub fn temporary_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple())
}
