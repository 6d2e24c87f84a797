//! Decision model: what happens to a task after a failed attempt.
//!
//! This module defines the Decision type (what to do next) and the Decider trait
//! (how to determine it from the task's attempt history).

use std::time::Duration;

use super::Task;
use crate::queue::RetryPolicy;

/// The next action to take for a task whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Return the task to `pending`, claimable again after `delay`.
    Requeue { delay: Duration, reason: String },

    /// Mark the task as permanently `failed`.
    Fail { reason: String },
}

/// Deciders are pure functions: given the task and the failure reason,
/// they return the next action without side effects.
pub trait Decider: Send + Sync {
    /// `task.attempts` already includes the attempt that just failed.
    fn decide(&self, task: &Task, reason: &str) -> Decision;
}

/// Attempt-based retry:
/// - requeue while attempts < max_attempts
/// - fail once attempts >= max_attempts
/// - delay from the RetryPolicy
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, reason: &str) -> Decision {
        if task.attempts >= task.max_attempts {
            Decision::Fail {
                reason: format!(
                    "{reason} (max attempts reached: {}/{})",
                    task.attempts, task.max_attempts
                ),
            }
        } else {
            Decision::Requeue {
                delay: self.retry_policy.next_delay(task.attempts),
                reason: reason.to_string(),
            }
        }
    }
}
