//! Task lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a task.
///
/// State transitions:
/// - Pending -> Claimed -> Running -> Completed
/// - Pending -> Claimed -> Running -> Failed (attempts exhausted)
/// - Claimed/Running -> Pending (lease expired, or failure with attempts left)
/// - Claimed -> Completed/Failed (release without an explicit `running` step)
///
/// Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Does a task in this state carry a lease (holder + expiry)?
    pub fn holds_lease(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    /// The transition table. Everything not listed here is rejected.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Claimed, Pending)
                | (Running, Pending)
                | (Claimed, Completed)
                | (Running, Completed)
                | (Claimed, Failed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status `{0}`")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::claim(TaskStatus::Pending, TaskStatus::Claimed, true)]
    #[case::start(TaskStatus::Claimed, TaskStatus::Running, true)]
    #[case::complete(TaskStatus::Running, TaskStatus::Completed, true)]
    #[case::fail(TaskStatus::Running, TaskStatus::Failed, true)]
    #[case::requeue_running(TaskStatus::Running, TaskStatus::Pending, true)]
    #[case::requeue_claimed(TaskStatus::Claimed, TaskStatus::Pending, true)]
    #[case::skip_claim(TaskStatus::Pending, TaskStatus::Running, false)]
    #[case::pending_to_done(TaskStatus::Pending, TaskStatus::Completed, false)]
    #[case::back_to_claimed(TaskStatus::Running, TaskStatus::Claimed, false)]
    #[case::revive_completed(TaskStatus::Completed, TaskStatus::Pending, false)]
    #[case::revive_failed(TaskStatus::Failed, TaskStatus::Pending, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [TaskStatus::Completed, TaskStatus::Failed] {
            assert!(from.is_terminal());
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!("RUNNING".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert!("queued".parse::<TaskStatus>().is_err());
    }
}
