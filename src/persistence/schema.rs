//! `SQLite` schema bootstrap logic.
//!
//! Table definitions use `CREATE TABLE IF NOT EXISTS`, so this is safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id                TEXT PRIMARY KEY NOT NULL,
    user_id           TEXT NOT NULL,
    working_directory TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    last_used         TEXT NOT NULL,
    total_cost        REAL NOT NULL DEFAULT 0,
    total_turns       INTEGER NOT NULL DEFAULT 0,
    message_count     INTEGER NOT NULL DEFAULT 0,
    tools_used        TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_session_user_dir
    ON session (user_id, working_directory, last_used);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
