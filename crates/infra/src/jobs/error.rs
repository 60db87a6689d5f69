use thiserror::Error;

use crate::job_store::StoreError;

/// Job manager error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobManagerError {
    /// Submissions are administratively disabled.
    #[error("not accepting jobs")]
    ShuttingDown,
    #[error("unknown dispatcher: {0}")]
    UnknownDispatcher(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Startup-time dispatcher registry error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("dispatcher registered twice: {0}")]
    Duplicate(String),
}

/// Worker pool hand-off error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every worker is busy and the hand-off queue is full.
    #[error("worker pool {0} is saturated")]
    Saturated(String),
    #[error("worker pool {0} is shut down")]
    ShutDown(String),
}
