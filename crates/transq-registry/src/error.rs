//! Registry error types.

use thiserror::Error;
use transq_models::TransitionError;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The job left PROCESSING before the lock holder reported in.
    #[error("Job is not locked: {0}")]
    NotLocked(String),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn duplicate_job(id: impl Into<String>) -> Self {
        Self::DuplicateJob(id.into())
    }

    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::JobNotFound(id.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn not_locked(id: impl Into<String>) -> Self {
        Self::NotLocked(id.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Redis(_) | RegistryError::ConnectionFailed(_)
        )
    }
}

impl From<TransitionError> for RegistryError {
    fn from(e: TransitionError) -> Self {
        Self::InvalidTransition(e.to_string())
    }
}
