use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

/// Coarse classification of a [`KernelError`].
///
/// Callers branch on this tag instead of matching every variant, e.g. retry
/// on `Timeout` but never on `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Cancelled,
    Configuration,
    Other,
}

#[derive(Debug, Error)]
pub enum KernelError {
    /// A deadline elapsed while the request was still queued.
    #[error("[{name}] wait timed out")]
    Timeout { name: String },

    /// The external cancel token fired while the request was still queued.
    #[error("[{name}] wait cancelled")]
    Cancelled { name: String },

    /// Raised by `check_cancel` once a cancellation request has been observed.
    #[error("task {0} was cancelled")]
    TaskCancelled(TaskId),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("no {kind} profile for key={key}")]
    UnknownProfile { kind: &'static str, key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KernelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::Timeout { .. } => ErrorKind::Timeout,
            KernelError::Cancelled { .. } | KernelError::TaskCancelled(_) => ErrorKind::Cancelled,
            KernelError::Configuration(_) | KernelError::UnknownProfile { .. } => {
                ErrorKind::Configuration
            }
            KernelError::Store(_) => ErrorKind::Other,
        }
    }

    /// True for both queue-level and task-level cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Errors reported by a [`TaskStore`](crate::ports::TaskStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("corrupt row id={id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("storage backend: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether writing the same patch again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}
