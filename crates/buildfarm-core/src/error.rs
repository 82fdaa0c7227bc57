//! Error types for buildfarm.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The saved state of a paused build could not be reloaded.
    #[error("corrupt resume state: {0}")]
    CorruptResumeState(String),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
