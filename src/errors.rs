use thiserror::Error;

use crate::coordinator::TransactionState;
use crate::twopc::ResourceError;

#[derive(Error, Debug)]
pub enum ThothError {
    /// Misuse of the API. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot {action} while transaction is {state:?}")]
    InvalidState {
        action: &'static str,
        state: TransactionState,
    },

    #[error("Resource failure: {message}")]
    ResourceFailure {
        message: String,
        #[source]
        source: Option<ResourceError>,
    },

    #[error("Optimistic lock failure: {message}")]
    OptimisticLock { message: String, retriable: bool },

    #[error("Deadlock detected: {0}")]
    DeadlockDetected(String),

    #[error("Rollback only: {message}")]
    RollbackOnly { message: String, timed_out: bool },

    #[error("Timed out: {message}")]
    TimedOut { message: String, retriable: bool },

    #[error("Commit failed: {message}")]
    CommitFailed {
        message: String,
        timed_out: bool,
        #[source]
        source: Option<Box<ThothError>>,
    },

    #[error("Persistence error: {message}")]
    Persistence { message: String, retriable: bool },
}

impl ThothError {
    /// Whether the caller may retry the whole unit of work.
    pub fn is_retriable(&self) -> bool {
        match self {
            ThothError::DeadlockDetected(_) => true,
            ThothError::OptimisticLock { retriable, .. }
            | ThothError::TimedOut { retriable, .. }
            | ThothError::Persistence { retriable, .. } => *retriable,
            ThothError::CommitFailed { source, .. } => {
                source.as_ref().is_some_and(|cause| cause.is_retriable())
            }
            _ => false,
        }
    }

    /// Whether the failure was caused by the transaction deadline.
    pub fn is_timed_out(&self) -> bool {
        match self {
            ThothError::RollbackOnly { timed_out, .. }
            | ThothError::CommitFailed { timed_out, .. } => *timed_out,
            ThothError::TimedOut { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn resource(message: impl Into<String>, source: ResourceError) -> Self {
        ThothError::ResourceFailure {
            message: message.into(),
            source: Some(source),
        }
    }
}

impl From<ResourceError> for ThothError {
    fn from(source: ResourceError) -> Self {
        ThothError::ResourceFailure {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, ThothError>;
