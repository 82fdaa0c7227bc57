//! Scheduler error types.

use buildfarm_core::BuildRequestId;
use buildfarm_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Db(#[from] DbError),

    #[error("executor error: {0}")]
    Executor(#[from] buildfarm_core::Error),

    #[error("build request {0} has no running build on this coordinator")]
    NotRunning(BuildRequestId),

    /// The worker or a builder lock was taken between matching and start.
    #[error("resources unavailable: {0}")]
    ResourcesUnavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
