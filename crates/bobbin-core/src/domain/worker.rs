use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, WorkerId};
use crate::ports::clock::span;

/// Capability tags; order-irrelevant, deduplicated.
pub type Capabilities = BTreeSet<String>;

/// A worker as the registry stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub capabilities: Capabilities,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// A worker is dead once `now - last_heartbeat` exceeds the threshold.
    pub fn is_alive(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_heartbeat <= span(threshold)
    }
}

/// Read view of a worker.
///
/// `current_task` is derived from the task store at read time, so it always
/// agrees with the task-side lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub capabilities: Capabilities,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task: Option<TaskId>,
    pub alive: bool,
}

impl Worker {
    pub fn from_record(
        record: WorkerRecord,
        current_task: Option<TaskId>,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Self {
        let alive = record.is_alive(now, liveness);
        Self {
            id: record.id,
            capabilities: record.capabilities,
            last_heartbeat: record.last_heartbeat,
            current_task,
            alive,
        }
    }
}
