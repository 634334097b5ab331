mod lock;
mod outbox;
mod repository;
mod transaction;

use eventkeel::{Error, Version};
use thiserror::Error;

pub use lock::PostgresLockBackend;
pub use outbox::PostgresOutboxStore;
pub use repository::PostgresRepository;
pub use transaction::PostgresTransaction;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("DB Error {0}")]
    DbError(#[from] sqlx::Error),
    #[error("Serialization Error {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid Version Number")]
    InvalidVersionNumber,
    #[error("Invalid Retry Count {0}")]
    InvalidRetryCount(i32),
    #[error(transparent)]
    Rejected(#[from] Error),
}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::DbError(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::Protocol(_) => Error::infrastructure(e.to_string()),
                e => Error::fatal(e.to_string()),
            },
            DbError::SerializationError(e) => e.into(),
            DbError::InvalidVersionNumber => Error::validation("stored version is out of range"),
            DbError::InvalidRetryCount(count) => {
                Error::validation(format!("stored retry count {count} is out of range"))
            }
            DbError::Rejected(e) => e,
        }
    }
}

/// Whether `e` is the unique violation raised when two writers insert the
/// same stream version.
pub(crate) fn is_version_conflict(e: &sqlx::Error) -> bool {
    e.as_database_error().is_some_and(|db_error| {
        db_error.code().as_deref() == Some("23505")
            && db_error.message().contains("aggregate_version")
    })
}

pub(crate) fn to_db_version(version: Version) -> Result<i64, DbError> {
    i64::try_from(version).map_err(|_| DbError::InvalidVersionNumber)
}

pub(crate) fn from_db_version(version: i64) -> Result<Version, DbError> {
    Version::try_from(version).map_err(|_| DbError::InvalidVersionNumber)
}
