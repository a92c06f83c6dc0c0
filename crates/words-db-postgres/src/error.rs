//! Error types for the PostgreSQL storage backend.

use sqlx_core::error::Error as SqlxError;
use words_repost::QueueError;
use words_storage::StorageError;

/// PostgreSQL error code for unique violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL error code for undefined table (42P01).
pub const PG_UNDEFINED_TABLE: &str = "42P01";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

pub fn is_unique_violation(err: &SqlxError) -> bool {
    has_pg_error_code(err, PG_UNIQUE_VIOLATION)
}

pub fn is_undefined_table(err: &SqlxError) -> bool {
    has_pg_error_code(err, PG_UNDEFINED_TABLE)
}

/// Errors specific to the PostgreSQL storage backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Connection(#[from] SqlxError),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(SqlxError::RowNotFound) => {
                StorageError::internal("query returned no rows")
            }
            PostgresError::Connection(e @ SqlxError::Database(_)) if is_undefined_table(&e) => {
                StorageError::internal(format!("Schema missing, run migrations: {e}"))
            }
            PostgresError::Connection(e) => StorageError::connection_error(e.to_string()),
            PostgresError::Migration(e) => StorageError::internal(format!("Migration error: {e}")),
            PostgresError::Config { message } => {
                StorageError::internal(format!("Configuration error: {message}"))
            }
        }
    }
}

impl From<PostgresError> for QueueError {
    fn from(err: PostgresError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

/// Maps a sqlx error straight into a storage error.
pub(crate) fn storage_err(err: SqlxError) -> StorageError {
    PostgresError::from(err).into()
}

/// Maps a sqlx error straight into a queue error.
pub(crate) fn queue_err(err: SqlxError) -> QueueError {
    PostgresError::from(err).into()
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
