//! Error types for the repost pipeline.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;
use words_storage::StorageError;

/// Outcome of a single delivery attempt against an external service.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Service rejected credentials: {0}")]
    ServiceUnauthorized(String),

    #[error("Service target not found: {0}")]
    ServiceNotFound(String),

    #[error("Service rate limited: {message}")]
    ServiceRateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Unknown service error: {0}")]
    ServiceUnknown(String),

    #[error("Service rejected message content: {0}")]
    PayloadRejected(String),
}

impl DeliveryError {
    /// Errors that invalidate the subscription itself.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnauthorized(_) | Self::ServiceNotFound(_)
        )
    }

    /// Errors worth another attempt later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_)
                | Self::ServiceRateLimited { .. }
                | Self::ServiceUnavailable(_)
                | Self::ServiceUnknown(_)
        )
    }

    /// Minimum wait requested by the service, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ServiceRateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<StorageError> for DeliveryError {
    fn from(err: StorageError) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

/// Result a task handler returns to the queue layer.
///
/// `Ok(())` completes the task. `Retryable` schedules another attempt while the
/// retry budget lasts. `Fatal` moves the task to the failed state immediately.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("{message}")]
    Retryable {
        message: String,
        /// Lower bound for the next delay, on top of the retry policy.
        retry_after: Option<Duration>,
    },

    #[error("{0}")]
    Fatal(String),
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<QueueError> for TaskError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::PayloadTooLarge { .. } | QueueError::Serialization(_) => {
                Self::Fatal(err.to_string())
            }
            _ => Self::retryable(err.to_string()),
        }
    }
}

/// Errors raised by task queue backends.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Task payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Task payload error: {0}")]
    Serialization(String),

    #[error("No route configured for task {0}")]
    Unrouted(String),

    #[error("Queue backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors surfaced to callers of the repost API.
#[derive(Debug, Error)]
pub enum RepostError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(String),
}

pub type RepostResult<T> = Result<T, RepostError>;
