//! Persistence layer modules.
//!
//! Only the session registry talks to storage.

pub mod db;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
