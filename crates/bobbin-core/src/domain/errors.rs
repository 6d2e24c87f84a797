//! Errors surfaced by the dispatch engine, and how callers should treat them.

use thiserror::Error;

use super::{TaskId, TaskStatus, WorkerId};
use crate::ports::StoreError;

/// Operational classification of a [`QueueError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown id; surfaced to the caller, not retried.
    NotFound,
    /// Lost a race or acted on stale state; ask the scheduler again, never
    /// retry blindly against the same task.
    Contention,
    /// Heartbeat/poll from an unregistered worker; the worker must register.
    UnknownWorker,
    /// Malformed input.
    Invalid,
    /// Store failure; retry with backoff at the boundary.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),

    #[error("task {0} was already claimed")]
    AlreadyClaimed(TaskId),

    #[error("invalid transition: cannot {action} task {task} in status {from}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        action: &'static str,
    },

    #[error("worker {worker} does not hold the lease on task {task}")]
    NotLeaseHolder { task: TaskId, worker: WorkerId },

    #[error("task {0} was modified concurrently")]
    Conflict(TaskId),

    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),

    #[error("invalid input: {0}")]
    InvalidPayload(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::TaskNotFound(_) | QueueError::WorkerNotFound(_) => ErrorKind::NotFound,
            QueueError::AlreadyClaimed(_)
            | QueueError::InvalidTransition { .. }
            | QueueError::NotLeaseHolder { .. }
            | QueueError::Conflict(_) => ErrorKind::Contention,
            QueueError::UnknownWorker(_) => ErrorKind::UnknownWorker,
            QueueError::InvalidPayload(_) => ErrorKind::Invalid,
            QueueError::StoreUnavailable(_) => ErrorKind::Infrastructure,
        }
    }

    /// Only infrastructure failures are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }

    pub fn is_contention(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        QueueError::StoreUnavailable(err.to_string())
    }
}

impl From<super::ids::IdError> for QueueError {
    fn from(err: super::ids::IdError) -> Self {
        QueueError::InvalidPayload(err.to_string())
    }
}
