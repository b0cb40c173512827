//! # Printer Store Errors
//!
//! ```text
//! sqlx::Error / MigrateError / serde_json::Error
//!        │
//!        ▼
//!    DbError ── is_retryable() ──┬── true  → SyncError::StoreUnavailable (retried)
//!                                └── false → SyncError::StoreFailed
//! ```

use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A second row tried to take a unique column value (remote identity).
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// The file could not be opened, or the pool is closed.
    #[error("Cannot open printer store: {0}")]
    ConnectionFailed(String),

    #[error("Schema migration failed: {0}")]
    MigrationFailed(String),

    /// SQLite reported an error for a statement (locked, I/O, constraint).
    #[error("Statement failed: {0}")]
    QueryFailed(String),

    /// A stored body is not a valid printer config.
    #[error("Corrupt record body: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No free connection in the pool")]
    PoolExhausted,

    /// A row holds a value the record model cannot represent.
    #[error("Invalid row: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::ConnectionFailed(_) | DbError::PoolExhausted | DbError::QueryFailed(_)
        )
    }
}

/// Column named in a SQLite `UNIQUE constraint failed: table.column` message.
fn unique_column(message: &str) -> Option<&str> {
    message
        .strip_prefix("UNIQUE constraint failed: ")
        .map(|cols| cols.rsplit('.').next().unwrap_or(cols))
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Printer", "?"),
            sqlx::Error::Database(db_err) => match unique_column(db_err.message()) {
                Some(column) => DbError::duplicate(column, "?"),
                None => DbError::QueryFailed(db_err.message().to_string()),
            },
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool closed".into()),
            sqlx::Error::Io(io) => DbError::ConnectionFailed(io.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DbError::PoolExhausted.is_retryable());
        assert!(DbError::ConnectionFailed("disk".into()).is_retryable());
        assert!(!DbError::not_found("Printer", "x").is_retryable());
        assert!(!DbError::duplicate("identity", "7").is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[test]
    fn test_unique_column_is_extracted() {
        assert_eq!(
            unique_column("UNIQUE constraint failed: printers.identity"),
            Some("identity")
        );
        assert_eq!(unique_column("database is locked"), None);
    }
}
