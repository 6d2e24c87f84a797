//! Lifecycle state machine.
//!
//! Every function here is pure: it takes the task as last read from the store
//! and returns the next version (or the reason the transition is refused).
//! Callers persist the result with `TaskStore::swap` keyed on the version they
//! read, so a stale computation can never overwrite a newer one.
//!
//! Each successful transition bumps `revision` and `updated_at`, and keeps the
//! lease invariant: holder and expiry are set exactly while the task is
//! `claimed` or `running`.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{Decider, Decision, QueueError, Task, TaskStatus, WorkerId};
use crate::ports::clock::span;

fn refuse(task: &Task, action: &'static str) -> QueueError {
    QueueError::InvalidTransition {
        task: task.id,
        from: task.status,
        action,
    }
}

/// Terminal tasks refuse everything; otherwise the caller must hold a live lease.
fn ensure_holder(task: &Task, worker: &WorkerId, action: &'static str, now: DateTime<Utc>) -> Result<(), QueueError> {
    if task.status.is_terminal() {
        return Err(refuse(task, action));
    }
    if !task.is_held_by(worker) || task.lease_expired(now) {
        return Err(QueueError::NotLeaseHolder {
            task: task.id,
            worker: worker.clone(),
        });
    }
    Ok(())
}

fn advance(task: &Task, status: TaskStatus, now: DateTime<Utc>) -> Task {
    debug_assert!(task.status == status || task.status.can_transition_to(status));
    let mut next = task.clone();
    next.status = status;
    next.revision += 1;
    next.updated_at = now;
    if !status.holds_lease() {
        next.lease_holder = None;
        next.lease_expires_at = None;
    }
    next
}

/// `pending -> claimed`: grant `worker` a lease of `lease` and count the attempt.
pub fn claim(task: &Task, worker: &WorkerId, lease: Duration, now: DateTime<Utc>) -> Result<Task, QueueError> {
    match task.status {
        TaskStatus::Pending if task.is_claimable(now) => {}
        TaskStatus::Pending => return Err(refuse(task, "claim (retry backoff pending)")),
        TaskStatus::Claimed | TaskStatus::Running => return Err(QueueError::AlreadyClaimed(task.id)),
        TaskStatus::Completed | TaskStatus::Failed => return Err(refuse(task, "claim")),
    }

    let mut next = advance(task, TaskStatus::Claimed, now);
    next.attempts += 1;
    next.lease_holder = Some(worker.clone());
    next.lease_expires_at = Some(now + span(lease));
    next.run_after = None;
    Ok(next)
}

/// `claimed -> running`, holder only. The lease expiry is kept.
pub fn mark_running(task: &Task, worker: &WorkerId, now: DateTime<Utc>) -> Result<Task, QueueError> {
    if task.status != TaskStatus::Claimed || !task.is_held_by(worker) {
        return Err(refuse(task, "mark running"));
    }
    if task.lease_expired(now) {
        return Err(QueueError::NotLeaseHolder {
            task: task.id,
            worker: worker.clone(),
        });
    }
    Ok(advance(task, TaskStatus::Running, now))
}

/// Extend a live lease to `now + extension`.
pub fn renew(task: &Task, worker: &WorkerId, extension: Duration, now: DateTime<Utc>) -> Result<Task, QueueError> {
    ensure_holder(task, worker, "renew", now)?;
    let mut next = advance(task, task.status, now);
    next.lease_expires_at = Some(now + span(extension));
    Ok(next)
}

/// `claimed | running -> completed`, holder only.
pub fn complete(
    task: &Task,
    worker: &WorkerId,
    result: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<Task, QueueError> {
    ensure_holder(task, worker, "complete", now)?;
    let mut next = advance(task, TaskStatus::Completed, now);
    next.result = result;
    Ok(next)
}

/// Failed attempt reported by the holder; the decider picks requeue or fail.
pub fn fail(
    task: &Task,
    worker: &WorkerId,
    reason: &str,
    decider: &dyn Decider,
    now: DateTime<Utc>,
) -> Result<Task, QueueError> {
    ensure_holder(task, worker, "fail", now)?;
    Ok(apply_failure(task, reason, decider, now))
}

/// Failure synthesized for an absent holder (expired lease or dead worker).
///
/// Counts as a failed attempt, under the same retry policy as [`fail`].
pub fn expire(task: &Task, reason: &str, decider: &dyn Decider, now: DateTime<Utc>) -> Result<Task, QueueError> {
    if !task.status.holds_lease() {
        return Err(refuse(task, "expire lease"));
    }
    Ok(apply_failure(task, reason, decider, now))
}

fn apply_failure(task: &Task, reason: &str, decider: &dyn Decider, now: DateTime<Utc>) -> Task {
    match decider.decide(task, reason) {
        Decision::Requeue { delay, reason } => {
            let mut next = advance(task, TaskStatus::Pending, now);
            next.last_error = Some(reason);
            next.run_after = (!delay.is_zero()).then(|| now + span(delay));
            next
        }
        Decision::Fail { reason } => {
            let mut next = advance(task, TaskStatus::Failed, now);
            next.last_error = Some(reason);
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, NewTask, TaskId};
    use crate::queue::RetryPolicy;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;
    use ulid::Ulid;

    const LEASE: Duration = Duration::from_secs(30);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn pending(max_attempts: u32) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new("t", json!({}), 0),
            max_attempts,
            at(0),
        )
    }

    fn claimed_by(name: &str) -> Task {
        claim(&pending(3), &worker(name), LEASE, at(0)).unwrap()
    }

    #[test]
    fn claim_sets_lease_and_counts_attempt() {
        let task = pending(3);
        let next = claim(&task, &worker("a"), LEASE, at(1)).unwrap();

        assert_eq!(next.status, TaskStatus::Claimed);
        assert_eq!(next.attempts, 1);
        assert_eq!(next.lease_holder, Some(worker("a")));
        assert_eq!(next.lease_expires_at, Some(at(31)));
        assert_eq!(next.revision, task.revision + 1);
        assert!(next.lease_is_consistent());
    }

    #[test]
    fn claim_refuses_held_and_terminal_tasks() {
        let held = claimed_by("a");
        assert!(matches!(
            claim(&held, &worker("b"), LEASE, at(1)),
            Err(QueueError::AlreadyClaimed(_))
        ));

        let done = complete(&held, &worker("a"), None, at(1)).unwrap();
        assert!(matches!(
            claim(&done, &worker("b"), LEASE, at(2)),
            Err(QueueError::InvalidTransition { from: TaskStatus::Completed, .. })
        ));
    }

    #[test]
    fn claim_waits_for_backoff() {
        let mut task = pending(3);
        task.run_after = Some(at(10));
        assert!(claim(&task, &worker("a"), LEASE, at(5)).is_err());
        assert!(claim(&task, &worker("a"), LEASE, at(10)).is_ok());
    }

    #[rstest]
    #[case::holder("a", true)]
    #[case::stranger("b", false)]
    fn mark_running_is_holder_only(#[case] caller: &str, #[case] allowed: bool) {
        let result = mark_running(&claimed_by("a"), &worker(caller), at(1));
        match (allowed, result) {
            (true, Ok(next)) => {
                assert_eq!(next.status, TaskStatus::Running);
                assert_eq!(next.lease_expires_at, Some(at(30)));
            }
            (false, Err(QueueError::InvalidTransition { .. })) => {}
            (_, other) => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case::stranger("b", 1)]
    #[case::expired("a", 31)]
    fn renew_and_release_require_live_lease(#[case] caller: &str, #[case] secs: i64) {
        let task = claimed_by("a");
        let decider = DefaultDecider::default();
        let w = worker(caller);

        assert!(matches!(
            renew(&task, &w, LEASE, at(secs)),
            Err(QueueError::NotLeaseHolder { .. })
        ));
        assert!(matches!(
            complete(&task, &w, None, at(secs)),
            Err(QueueError::NotLeaseHolder { .. })
        ));
        assert!(matches!(
            fail(&task, &w, "boom", &decider, at(secs)),
            Err(QueueError::NotLeaseHolder { .. })
        ));
    }

    #[test]
    fn renew_extends_from_now() {
        let next = renew(&claimed_by("a"), &worker("a"), LEASE, at(20)).unwrap();
        assert_eq!(next.lease_expires_at, Some(at(50)));
        assert_eq!(next.status, TaskStatus::Claimed);
    }

    #[test]
    fn complete_stores_result_and_clears_lease() {
        let running = mark_running(&claimed_by("a"), &worker("a"), at(1)).unwrap();
        let done = complete(&running, &worker("a"), Some(json!({"ok": true})), at(2)).unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"ok": true})));
        assert!(done.lease_is_consistent());
        assert!(matches!(
            complete(&done, &worker("a"), None, at(3)),
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn failure_requeues_with_backoff_then_fails_at_max() {
        let decider = DefaultDecider::new(RetryPolicy::fixed(Duration::from_secs(5)));
        let a = worker("a");

        let mut task = pending(2);
        task = claim(&task, &a, LEASE, at(0)).unwrap();
        task = fail(&task, &a, "boom", &decider, at(1)).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.run_after, Some(at(6)));
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert!(task.lease_is_consistent());

        task = claim(&task, &a, LEASE, at(6)).unwrap();
        task = expire(&task, "lease expired", &decider, at(40)).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert!(task.last_error.unwrap().contains("lease expired"));
    }

    #[test]
    fn zero_delay_requeue_is_immediately_claimable() {
        let decider = DefaultDecider::default();
        let task = expire(&claimed_by("a"), "lease expired", &decider, at(31)).unwrap();
        assert_eq!(task.run_after, None);
        assert!(task.is_claimable(at(31)));
    }

    #[test]
    fn expire_refuses_unleased_tasks() {
        let decider = DefaultDecider::default();
        assert!(expire(&pending(3), "x", &decider, at(0)).is_err());
    }
}
