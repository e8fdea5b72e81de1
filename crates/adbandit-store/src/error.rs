//! Store failure modes.

use adbandit_models::{ErrorClass, ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    /// Lock-wait timeout. The caller retries once with a fresh snapshot;
    /// a second failure escalates the campaign to `Errored`.
    #[error("lock wait timed out")]
    LockTimeout,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invariant breach: {0}")]
    InvariantBreach(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Sqlite(_) => ErrorClass::Fatal,
            StoreError::LockTimeout => ErrorClass::Concurrency,
            StoreError::Validation(_) => ErrorClass::Validation,
            StoreError::NotFound { .. } => ErrorClass::Validation,
            StoreError::Serialization(_) => ErrorClass::Permanent,
            StoreError::InvariantBreach(_) => ErrorClass::InvariantBreach,
        }
    }
}

/// Map busy/locked conditions onto the concurrency class so the retry
/// policy can distinguish them from hard database failures.
pub(crate) fn db_err(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return StoreError::LockTimeout;
        }
    }
    StoreError::Sqlite(e)
}

pub type Result<T> = std::result::Result<T, StoreError>;
