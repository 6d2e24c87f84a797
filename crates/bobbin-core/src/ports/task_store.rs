//! TaskStore port - the source of truth for tasks and their leases.
//!
//! Every lifecycle transition is persisted through [`TaskStore::swap`], a
//! compare-and-swap keyed on the status and revision the caller last read.
//! No component keeps authoritative task state anywhere else.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Capabilities, Task, TaskFilter, TaskId, TaskStatus, WorkerId};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, I/O or query failure. Transient.
    #[error("{0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Insert of an id that already exists.
    #[error("duplicate task id {0}")]
    Duplicate(TaskId),
}

/// The row version a transition was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub status: TaskStatus,
    pub revision: u64,
}

impl Expected {
    pub fn of(task: &Task) -> Self {
        Self {
            status: task.status,
            revision: task.revision,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row changed (or vanished) since it was read, or the exclusive
    /// holder guard failed. Nothing was written.
    Conflict,
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Claimed => self.claimed += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Claimed => self.claimed,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Durable task storage with conditional updates.
///
/// Ordering wherever tasks are returned in queue order: priority ascending,
/// then `created_at` ascending, then insertion order.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks claimable at `now` whose requirements are a subset of
    /// `capabilities`, in queue order, at most `limit`.
    async fn pending_candidates(
        &self,
        now: DateTime<Utc>,
        capabilities: &Capabilities,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Claimed/running tasks whose lease expired strictly before `now`.
    async fn expired_leases(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<Task>, StoreError>;

    /// All claimed/running tasks.
    async fn leases_held(&self) -> Result<Vec<Task>, StoreError>;

    /// The task whose lease `worker` currently holds, if any.
    async fn held_by(&self, worker: &WorkerId) -> Result<Option<Task>, StoreError>;

    /// Replace the stored row with `next` if it still matches `expected`.
    ///
    /// With `exclusive_holder`, the write also requires that no other task is
    /// leased to `next.lease_holder` (a worker holds at most one lease).
    async fn swap(
        &self,
        expected: Expected,
        next: &Task,
        exclusive_holder: bool,
    ) -> Result<CasOutcome, StoreError>;

    /// Remove a task, returning the row as it was.
    async fn delete(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;
}
