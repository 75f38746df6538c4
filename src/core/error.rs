//! Error types for the storage layer
//!
//! Lookups that find nothing return `Ok(None)`; everything in this enum is a
//! real failure the caller has to handle or report.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Storage error type
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique key collision, missing referenced entity, or mutation of a missing row
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A stored record could not be decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Key management or AEAD failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The active engine does not implement this operation
    #[error("Operation not supported in {0}")]
    Unsupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Migration {version} failed: {message}")]
    Migration { version: u32, message: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Key-value engine error: {0}")]
    Kv(#[from] redb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Stable tag for the error category
    pub fn error_type(&self) -> &'static str {
        match self {
            StoreError::ConstraintViolation(_) => "ConstraintViolation",
            StoreError::Encoding(_) => "EncodingError",
            StoreError::Crypto(_) => "CryptoError",
            StoreError::Unsupported(_) => "UnsupportedOperation",
            StoreError::InvalidInput(_) => "InvalidInput",
            StoreError::Migration { .. } => "MigrationError",
            StoreError::Database(_) => "DatabaseError",
            StoreError::Pool(_) => "PoolError",
            StoreError::Kv(_) => "KvError",
            StoreError::Io(_) => "IoError",
            StoreError::Config(_) => "ConfigError",
        }
    }

    /// Whether retrying the same call may succeed
    ///
    /// Constraint violations never qualify: the caller has to resolve the conflict.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            StoreError::Pool(_) => true,
            _ => false,
        }
    }

    /// Mutation of an entity that does not exist
    pub fn missing(entity: &str, id: impl std::fmt::Display) -> Self {
        StoreError::ConstraintViolation(format!("{} {} not found", entity, id))
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StoreError::ConstraintViolation(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, StoreError::Unsupported(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, msg)
                if inner.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation(
                    msg.clone().unwrap_or_else(|| inner.to_string()),
                )
            }
            _ => StoreError::Database(err),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

/// Map any redb error family into [`StoreError::Kv`]
pub fn kv_err<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Kv(err.into())
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            StoreError::ConstraintViolation("dup".into()).error_type(),
            "ConstraintViolation"
        );
        assert_eq!(
            StoreError::Unsupported("relational mode".into()).error_type(),
            "UnsupportedOperation"
        );
        assert_eq!(StoreError::Crypto("bad".into()).error_type(), "CryptoError");
    }

    #[test]
    fn test_sqlite_constraint_is_translated() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some("UNIQUE constraint failed: authors.name".to_string()),
        );
        let err: StoreError = raw.into();
        assert!(err.is_constraint_violation());
        assert!(err.to_string().contains("authors.name"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err: StoreError = raw.into();
        assert!(err.is_retryable());
        assert!(!StoreError::InvalidInput("x".into()).is_retryable());
    }

    #[test]
    fn test_json_error_becomes_encoding() {
        let err: StoreError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert_eq!(err.error_type(), "EncodingError");
    }
}
