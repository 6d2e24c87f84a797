use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueError;
use super::worker::Capabilities;
use super::{TaskId, TaskStatus, WorkerId};

/// Longest accepted task name (the task table keys on `VARCHAR(100)`).
pub const MAX_TASK_NAME_LEN: usize = 100;

/// Payload key consulted for required capabilities when a submission does
/// not list them explicitly.
pub const REQUIRED_CAPABILITIES_KEY: &str = "required_capabilities";

/// A unit of work and its lifecycle state.
///
/// Invariant: `lease_holder` and `lease_expires_at` are both set if and only
/// if `status` is `claimed` or `running`. Only `queue::lifecycle` produces new
/// versions of a task; stores persist them through a conditional swap keyed on
/// `(status, revision)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub payload: serde_json::Value,

    /// Lower is more urgent.
    pub priority: i32,
    pub status: TaskStatus,

    /// Present only once the task completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Number of claims so far (the current one included while leased).
    pub attempts: u32,
    pub max_attempts: u32,

    /// Capabilities a worker must advertise to be handed this task.
    #[serde(default)]
    pub requires: Capabilities,

    /// Reason of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub lease_holder: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Earliest time a requeued task may be claimed again (retry backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_after: Option<DateTime<Utc>>,

    /// Bumped on every persisted transition.
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh pending task from a validated submission.
    pub fn new(id: TaskId, submission: NewTask, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        let requires = submission.required_capabilities();
        Self {
            id,
            name: submission.name.trim().to_string(),
            payload: submission.payload,
            priority: submission.priority,
            status: TaskStatus::Pending,
            result: None,
            attempts: 0,
            max_attempts: submission.max_attempts.unwrap_or(default_max_attempts),
            requires,
            last_error: None,
            lease_holder: None,
            lease_expires_at: None,
            run_after: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lease fields are present exactly when the status carries a lease.
    pub fn lease_is_consistent(&self) -> bool {
        let has_lease = self.lease_holder.is_some() && self.lease_expires_at.is_some();
        let no_lease = self.lease_holder.is_none() && self.lease_expires_at.is_none();
        if self.status.holds_lease() { has_lease } else { no_lease }
    }

    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.status.holds_lease() && self.lease_holder.as_ref() == Some(worker)
    }

    /// True once the lease (if any) has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|expiry| expiry < now)
    }

    /// Pending and past any retry backoff.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.run_after.is_none_or(|at| at <= now)
    }

    /// Exact-subset capability match.
    pub fn satisfied_by(&self, capabilities: &Capabilities) -> bool {
        self.requires.is_subset(capabilities)
    }

    /// Queue order: priority ascending, then oldest first.
    ///
    /// Stores break remaining ties by insertion order.
    pub fn queue_cmp(&self, other: &Task) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
    }
}

/// A producer's submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,

    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Capabilities>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NewTask {
    pub fn new(name: impl Into<String>, payload: serde_json::Value, priority: i32) -> Self {
        Self {
            name: name.into(),
            payload,
            priority,
            requires: None,
            max_attempts: None,
        }
    }

    pub fn with_requires<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = Some(capabilities.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Well-formedness only: payload schemas belong to the task implementations.
    pub fn validate(&self) -> Result<(), QueueError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(QueueError::InvalidPayload("task name must not be empty".into()));
        }
        if name.chars().count() > MAX_TASK_NAME_LEN {
            return Err(QueueError::InvalidPayload(format!(
                "task name longer than {MAX_TASK_NAME_LEN} characters"
            )));
        }
        if !self.payload.is_object() {
            return Err(QueueError::InvalidPayload("payload must be a JSON object".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(QueueError::InvalidPayload("max_attempts must be at least 1".into()));
        }
        if let Some(requires) = &self.requires
            && requires.iter().any(|c| c.trim().is_empty())
        {
            return Err(QueueError::InvalidPayload("capability tags must not be empty".into()));
        }
        Ok(())
    }

    /// Explicit `requires`, else the payload's `required_capabilities` array.
    pub fn required_capabilities(&self) -> Capabilities {
        if let Some(requires) = &self.requires {
            return requires.clone();
        }
        self.payload
            .get(REQUIRED_CAPABILITIES_KEY)
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str())
                    .filter(|t| !t.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            priority: None,
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.priority.is_none_or(|p| p == task.priority)
    }
}
