//! Session repository for `SQLite` persistence.
//!
//! Rows hold confirmed sessions only; placeholder sessions live in memory
//! until the backend assigns an id.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::session::Session;
use crate::{AppError, Result};

use super::db::Database;

/// Repository for session snapshots.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    working_directory: String,
    created_at: String,
    last_used: String,
    total_cost: f64,
    total_turns: i64,
    message_count: i64,
    tools_used: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let tools_used: BTreeSet<String> = serde_json::from_str(&self.tools_used)
            .map_err(|e| AppError::Db(format!("invalid tools_used: {e}")))?;
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            working_directory: PathBuf::from(self.working_directory),
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            last_used: parse_timestamp(&self.last_used, "last_used")?,
            total_cost: self.total_cost,
            total_turns: u32::try_from(self.total_turns).unwrap_or(u32::MAX),
            message_count: u32::try_from(self.message_count).unwrap_or(u32::MAX),
            tools_used,
            is_new: false,
        })
    }
}

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

/// Fixed-width UTC form so text ordering matches time ordering.
fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const SELECT_COLUMNS: &str = "SELECT id, user_id, working_directory, created_at, last_used, \
     total_cost, total_turns, message_count, tools_used FROM session";

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the snapshot for `session.id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, session: &Session) -> Result<()> {
        let tools_used = serde_json::to_string(&session.tools_used)
            .map_err(|e| AppError::Db(format!("failed to encode tools_used: {e}")))?;

        sqlx::query(
            "INSERT INTO session (id, user_id, working_directory, created_at, last_used,
                                  total_cost, total_turns, message_count, tools_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 last_used = excluded.last_used,
                 total_cost = excluded.total_cost,
                 total_turns = excluded.total_turns,
                 message_count = excluded.message_count,
                 tools_used = excluded.tools_used",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(session.working_directory.to_string_lossy().as_ref())
        .bind(timestamp(session.created_at))
        .bind(timestamp(session.last_used))
        .bind(session.total_cost)
        .bind(i64::from(session.total_turns))
        .bind(i64::from(session.message_count))
        .bind(&tools_used)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Retrieve a session by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Most recently used session for a user in a directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest_for_user_dir(
        &self,
        user_id: &str,
        working_directory: &Path,
    ) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE user_id = ?1 AND working_directory = ?2 \
             ORDER BY last_used DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(working_directory.to_string_lossy().as_ref())
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// All sessions owned by a user, most recently used first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE user_id = ?1 ORDER BY last_used DESC"
        ))
        .bind(user_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Delete a session. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete sessions idle since before `cutoff`.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_idle(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session WHERE last_used < ?1")
            .bind(timestamp(cutoff))
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
