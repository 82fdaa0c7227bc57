//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A row holds a value the domain types cannot represent.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<buildfarm_core::Error> for DbError {
    fn from(err: buildfarm_core::Error) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
