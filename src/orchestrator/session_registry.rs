//! Session registry: creation, promotion, usage accounting, expiry and
//! per-user LRU eviction.
//!
//! The registry exclusively owns the hot set (`id → Session`) behind an
//! async mutex. Confirmed sessions are mirrored to storage through the
//! optional [`SessionRepo`]; placeholder sessions stay in memory. The
//! mutex is never held across a storage call.
//!
//! Two concurrent executions against the same session id are not
//! coordinated; callers serialize per session.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::execution::ExecutionResult;
use crate::models::session::{Session, SessionStatus};
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

/// Registry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Idle hours before a session expires.
    pub timeout_hours: u64,
    /// Hot sessions allowed per user before LRU eviction.
    pub max_sessions_per_user: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout_hours: 24,
            max_sessions_per_user: 5,
        }
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RegistryStats {
    /// Sessions in the hot set.
    pub active_sessions: usize,
    /// Hot sessions still carrying a placeholder id.
    pub temporary_sessions: usize,
    /// Distinct users with a hot session.
    pub users: usize,
    /// Completed executions across hot sessions.
    pub total_messages: u64,
    /// Accumulated cost across hot sessions.
    pub total_cost: f64,
}

/// Owner of session lifecycle.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    repo: Option<SessionRepo>,
    config: RegistryConfig,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("persistent", &self.repo.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create a registry, optionally backed by storage.
    #[must_use]
    pub fn new(config: RegistryConfig, repo: Option<SessionRepo>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            repo,
            config,
        }
    }

    /// Registry limits.
    #[must_use]
    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    /// Resolve a session for `user_id` in `working_directory`.
    ///
    /// A matching live hot-set entry wins, then a persisted copy; otherwise
    /// a new placeholder session is allocated, evicting the user's least
    /// recently used session first when the user is at the cap.
    ///
    /// # Errors
    ///
    /// - `AppError::Unauthorized` when `session_id` belongs to another user.
    /// - `AppError::Db` when storage lookup fails.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        working_directory: &Path,
        session_id: Option<&str>,
    ) -> Result<Session> {
        let span = info_span!("session_get_or_create", user_id, session_id);
        self.resolve_or_allocate(user_id, working_directory, session_id)
            .instrument(span)
            .await
    }

    async fn resolve_or_allocate(
        &self,
        user_id: &str,
        working_directory: &Path,
        session_id: Option<&str>,
    ) -> Result<Session> {
        if let Some(id) = session_id {
            if let Some(session) = self.resolve_existing(user_id, id).await? {
                return Ok(session);
            }
        }

        let session = Session::new(user_id.to_owned(), working_directory.to_path_buf());
        self.insert_hot(session.clone()).await?;
        info!(session_id = %session.id, "created placeholder session");
        Ok(session)
    }

    async fn resolve_existing(&self, user_id: &str, id: &str) -> Result<Option<Session>> {
        let now = Utc::now();
        {
            let mut hot = self.sessions.lock().await;
            if let Some(session) = hot.get(id) {
                ensure_owner(session, user_id)?;
                if !session.is_expired(self.config.timeout_hours, now) {
                    debug!("session resolved from hot set");
                    return Ok(Some(session.clone()));
                }
                if let Some(expired) = hot.remove(id) {
                    log_expired(&expired, "idle timeout");
                }
            }
        }

        let Some(repo) = &self.repo else {
            return Ok(None);
        };
        let Some(session) = repo.get_by_id(id).await? else {
            return Ok(None);
        };
        ensure_owner(&session, user_id)?;
        if session.is_expired(self.config.timeout_hours, now) {
            repo.delete(id).await?;
            info!(session_id = id, "dropped expired persisted session");
            return Ok(None);
        }
        self.insert_hot(session.clone()).await?;
        debug!("session loaded from storage");
        Ok(Some(session))
    }

    /// Insert into the hot set, evicting the owner's LRU session at the cap.
    async fn insert_hot(&self, session: Session) -> Result<()> {
        let evicted = {
            let mut hot = self.sessions.lock().await;
            let evicted = evict_lru_if_full(&mut hot, &session.user_id, self.config.max_sessions_per_user);
            hot.insert(session.id.clone(), session);
            evicted
        };
        if let Some(evicted) = evicted {
            log_expired(&evicted, "per-user cap");
            if let Some(repo) = &self.repo {
                repo.delete(&evicted.id).await?;
            }
        }
        Ok(())
    }

    /// Replace a placeholder id with the backend-assigned one.
    ///
    /// Counters carry over unchanged. Promoting an already confirmed
    /// session, or promoting to the id the session already has, is a no-op
    /// returning the current state. If `backend_id` is already a confirmed
    /// hot session, the placeholder is dropped in its favor.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` when neither id is in the hot set.
    /// - `AppError::Db` when persisting the promoted session fails.
    pub async fn promote(&self, session_id: &str, backend_id: &str) -> Result<Session> {
        let promoted = {
            let mut hot = self.sessions.lock().await;

            if let Some(existing) = hot.get(backend_id).filter(|s| !s.is_new).cloned() {
                if session_id != backend_id && hot.get(session_id).is_some_and(|s| s.is_new) {
                    hot.remove(session_id);
                    debug!(session_id, backend_id, "placeholder merged into existing session");
                }
                return Ok(existing);
            }

            let mut session = hot
                .remove(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
            if session_id == backend_id || !session.confirm(backend_id) {
                hot.insert(session_id.to_owned(), session.clone());
                return Ok(session);
            }
            hot.insert(session.id.clone(), session.clone());
            session
        };

        info!(from = session_id, to = %promoted.id, "session promoted");
        if let Some(repo) = &self.repo {
            repo.upsert(&promoted).await?;
        }
        Ok(promoted)
    }

    /// Fold one completed execution into a session's counters.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` when the session is not in the hot set.
    /// - `AppError::Db` when persisting fails.
    pub async fn record_usage(&self, session_id: &str, result: &ExecutionResult) -> Result<Session> {
        let updated = {
            let mut hot = self.sessions.lock().await;
            let session = hot
                .get_mut(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
            session.record(result);
            session.clone()
        };

        debug!(
            session_id,
            message_count = updated.message_count,
            total_turns = updated.total_turns,
            "session usage recorded"
        );
        if let (Some(repo), false) = (&self.repo, updated.is_new) {
            repo.upsert(&updated).await?;
        }
        Ok(updated)
    }

    /// Drop a placeholder session whose first execution failed.
    ///
    /// Confirmed sessions are left untouched. Returns whether one was removed.
    pub async fn discard_placeholder(&self, session_id: &str) -> bool {
        let mut hot = self.sessions.lock().await;
        if hot.get(session_id).map(Session::status) != Some(SessionStatus::New) {
            return false;
        }
        if let Some(placeholder) = hot.remove(session_id) {
            log_expired(&placeholder, "failed first execution");
        }
        true
    }

    /// Evict every session idle longer than `timeout_hours`.
    ///
    /// Returns the number of hot sessions evicted. Idle persisted rows are
    /// purged as well.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when the storage purge fails.
    pub async fn expire_sweep(&self, timeout_hours: u64) -> Result<usize> {
        let now = Utc::now();
        let evicted = {
            let mut hot = self.sessions.lock().await;
            let idle: Vec<String> = hot
                .values()
                .filter(|session| session.is_expired(timeout_hours, now))
                .map(|session| session.id.clone())
                .collect();
            for id in &idle {
                if let Some(expired) = hot.remove(id) {
                    log_expired(&expired, "idle timeout");
                }
            }
            idle.len()
        };

        if let (Some(repo), Some(cutoff)) = (&self.repo, cutoff(now, timeout_hours)) {
            let purged = repo.purge_idle(cutoff).await?;
            if purged > 0 {
                debug!(purged, "purged idle persisted sessions");
            }
        }

        if evicted > 0 {
            info!(evicted, timeout_hours, "expired idle sessions");
        }
        Ok(evicted)
    }

    /// End a session explicitly. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when the storage delete fails.
    pub async fn end_session(&self, session_id: &str) -> Result<bool> {
        let removed_hot = match self.sessions.lock().await.remove(session_id) {
            Some(ended) => {
                log_expired(&ended, "ended");
                true
            }
            None => false,
        };
        let removed_stored = match &self.repo {
            Some(repo) => repo.delete(session_id).await?,
            None => false,
        };
        let removed = removed_hot || removed_stored;
        if removed {
            info!(session_id, "session ended");
        }
        Ok(removed)
    }

    /// Every session the user owns, most recently used first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when the storage query fails.
    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let mut sessions: HashMap<String, Session> = match &self.repo {
            Some(repo) => repo
                .list_for_user(user_id)
                .await?
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            None => HashMap::new(),
        };
        {
            let hot = self.sessions.lock().await;
            for session in hot.values().filter(|s| s.user_id == user_id) {
                sessions.insert(session.id.clone(), session.clone());
            }
        }

        let mut sessions: Vec<Session> = sessions.into_values().collect();
        sessions.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        Ok(sessions)
    }

    /// Look up one session, hot set first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when the storage query fails.
    pub async fn session_info(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.sessions.lock().await.get(session_id) {
            return Ok(Some(session.clone()));
        }
        match &self.repo {
            Some(repo) => repo.get_by_id(session_id).await,
            None => Ok(None),
        }
    }

    /// Most recently used confirmed, unexpired session for a user/directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when the storage query fails.
    pub async fn find_latest_confirmed(
        &self,
        user_id: &str,
        working_directory: &Path,
    ) -> Result<Option<Session>> {
        let now = Utc::now();
        let hot_best = {
            let hot = self.sessions.lock().await;
            hot.values()
                .filter(|s| {
                    s.user_id == user_id
                        && s.working_directory == working_directory
                        && !s.is_temporary()
                        && !s.is_expired(self.config.timeout_hours, now)
                })
                .max_by_key(|s| s.last_used)
                .cloned()
        };

        let stored_best = match &self.repo {
            Some(repo) => repo
                .latest_for_user_dir(user_id, working_directory)
                .await?
                .filter(|s| !s.is_expired(self.config.timeout_hours, now)),
            None => None,
        };

        Ok(match (hot_best, stored_best) {
            (Some(hot), Some(stored)) if stored.last_used > hot.last_used => Some(stored),
            (Some(hot), _) => Some(hot),
            (None, stored) => stored,
        })
    }

    /// Sessions currently in the hot set.
    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Aggregate counters over the hot set.
    pub async fn stats(&self) -> RegistryStats {
        let hot = self.sessions.lock().await;
        let mut users: Vec<&str> = hot.values().map(|s| s.user_id.as_str()).collect();
        users.sort_unstable();
        users.dedup();
        RegistryStats {
            active_sessions: hot.len(),
            temporary_sessions: hot.values().filter(|s| s.is_temporary()).count(),
            users: users.len(),
            total_messages: hot.values().map(|s| u64::from(s.message_count)).sum(),
            total_cost: hot.values().map(|s| s.total_cost).sum(),
        }
    }
}

/// Record a session leaving the hot set.
fn log_expired(session: &Session, cause: &'static str) {
    let from = session.status();
    debug_assert!(from.can_transition_to(SessionStatus::Expired));
    info!(
        session_id = %session.id,
        user_id = %session.user_id,
        ?from,
        to = ?SessionStatus::Expired,
        cause,
        "session left the hot set"
    );
}

fn ensure_owner(session: &Session, user_id: &str) -> Result<()> {
    if session.user_id == user_id {
        Ok(())
    } else {
        warn!(session_id = %session.id, user_id, "session owner mismatch");
        Err(AppError::Unauthorized(format!(
            "session {} belongs to another user",
            session.id
        )))
    }
}

/// Remove the user's least recently used session when at `cap`.
fn evict_lru_if_full(
    hot: &mut HashMap<String, Session>,
    user_id: &str,
    cap: usize,
) -> Option<Session> {
    let owned = hot.values().filter(|s| s.user_id == user_id).count();
    if cap == 0 || owned < cap {
        return None;
    }
    let victim = hot
        .values()
        .filter(|s| s.user_id == user_id)
        .min_by_key(|s| s.last_used)
        .map(|s| s.id.clone())?;
    hot.remove(&victim)
}

fn cutoff(now: DateTime<Utc>, timeout_hours: u64) -> Option<DateTime<Utc>> {
    i64::try_from(timeout_hours)
        .ok()
        .and_then(TimeDelta::try_hours)
        .and_then(|delta| now.checked_sub_signed(delta))
}
