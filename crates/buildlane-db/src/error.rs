//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for buildlane_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => buildlane_core::Error::NotFound(what),
            DbError::Duplicate(what) => buildlane_core::Error::Conflict(what),
            DbError::Serialization(e) => buildlane_core::Error::Serialization(e),
            other => buildlane_core::Error::Store(other.to_string()),
        }
    }
}

/// Map a driver error straight into the domain error.
pub(crate) fn store_err(err: sqlx::Error) -> buildlane_core::Error {
    DbError::from(err).into()
}
