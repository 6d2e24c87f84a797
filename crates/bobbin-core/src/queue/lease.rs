//! Lease manager: grants, renews and settles leases through conditional writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::lifecycle;
use crate::domain::{Decider, Outcome, QueueError, Task, TaskId, TaskStatus, WorkerId};
use crate::ports::{CasOutcome, Clock, Expected, TaskStore, WorkerStore};

/// Re-read/re-validate rounds before a transition gives up with `Conflict`.
const MAX_CAS_ATTEMPTS: usize = 4;

/// Failure reason recorded when a lease runs out before release.
pub const LEASE_EXPIRED: &str = "lease expired";

pub struct LeaseManager {
    tasks: Arc<dyn TaskStore>,
    workers: Arc<dyn WorkerStore>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn Decider>,
    availability: Arc<Notify>,
}

impl LeaseManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        workers: Arc<dyn WorkerStore>,
        clock: Arc<dyn Clock>,
        decider: Arc<dyn Decider>,
        availability: Arc<Notify>,
    ) -> Self {
        Self {
            tasks,
            workers,
            clock,
            decider,
            availability,
        }
    }

    /// Claim `task_id` for a registered worker.
    ///
    /// Losing the race to another claimant is `AlreadyClaimed`; the store
    /// decides the winner, never this process.
    pub async fn claim(&self, task_id: TaskId, worker: &WorkerId, lease: Duration) -> Result<Task, QueueError> {
        if self.workers.get(worker).await?.is_none() {
            return Err(QueueError::UnknownWorker(worker.clone()));
        }
        let task = self.load(task_id).await?;
        if let Some(held) = self.tasks.held_by(worker).await?
            && held.id != task_id
        {
            return Err(QueueError::InvalidTransition {
                task: task_id,
                from: task.status,
                action: "claim while holding another lease",
            });
        }
        self.claim_observed(&task, worker, lease).await
    }

    /// Claim a task exactly as it was read (the dispatcher's scan result).
    pub(crate) async fn claim_observed(
        &self,
        task: &Task,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Task, QueueError> {
        let next = lifecycle::claim(task, worker, lease, self.clock.now())?;
        match self.tasks.swap(Expected::of(task), &next, true).await? {
            CasOutcome::Applied => {
                tracing::info!(
                    task_id = %task.id,
                    worker_id = %worker,
                    attempt = next.attempts,
                    "task claimed"
                );
                Ok(next)
            }
            CasOutcome::Conflict => {
                tracing::debug!(task_id = %task.id, worker_id = %worker, "claim lost race");
                Err(QueueError::AlreadyClaimed(task.id))
            }
        }
    }

    /// `claimed -> running`.
    pub async fn mark_running(&self, task_id: TaskId, worker: &WorkerId) -> Result<Task, QueueError> {
        let next = self
            .transition(task_id, |task, now| lifecycle::mark_running(task, worker, now))
            .await?;
        tracing::info!(task_id = %task_id, worker_id = %worker, "task running");
        Ok(next)
    }

    /// Extend the caller's lease to `now + extension`. Also counts as a heartbeat.
    pub async fn renew(&self, task_id: TaskId, worker: &WorkerId, extension: Duration) -> Result<Task, QueueError> {
        let next = self
            .transition(task_id, |task, now| lifecycle::renew(task, worker, extension, now))
            .await?;
        self.workers.touch(worker, self.clock.now()).await?;
        tracing::debug!(task_id = %task_id, worker_id = %worker, "lease renewed");
        Ok(next)
    }

    /// Settle the caller's lease with an outcome.
    pub async fn release(&self, task_id: TaskId, worker: &WorkerId, outcome: Outcome) -> Result<Task, QueueError> {
        let decider = self.decider.as_ref();
        let next = match &outcome {
            Outcome::Success { result } => {
                self.transition(task_id, |task, now| {
                    lifecycle::complete(task, worker, result.clone(), now)
                })
                .await?
            }
            Outcome::Failure { reason } => {
                self.transition(task_id, |task, now| {
                    lifecycle::fail(task, worker, reason, decider, now)
                })
                .await?
            }
        };

        tracing::info!(
            task_id = %task_id,
            worker_id = %worker,
            status = %next.status,
            attempts = next.attempts,
            "lease released"
        );
        if next.status == TaskStatus::Pending {
            self.availability.notify_waiters();
        }
        Ok(next)
    }

    /// Synthesize a failure for an absent holder.
    ///
    /// `Ok(None)` means the row changed since `task` was read (the holder
    /// released or renewed first) and nothing was written.
    pub async fn revoke(&self, task: &Task, reason: &str, now: DateTime<Utc>) -> Result<Option<Task>, QueueError> {
        let next = lifecycle::expire(task, reason, self.decider.as_ref(), now)?;
        match self.tasks.swap(Expected::of(task), &next, false).await? {
            CasOutcome::Applied => {
                tracing::info!(
                    task_id = %task.id,
                    worker_id = ?task.lease_holder.as_ref().map(|w| w.as_str()),
                    status = %next.status,
                    attempts = next.attempts,
                    reason,
                    "lease revoked"
                );
                if next.status == TaskStatus::Pending {
                    self.availability.notify_waiters();
                }
                Ok(Some(next))
            }
            CasOutcome::Conflict => Ok(None),
        }
    }

    async fn load(&self, task_id: TaskId) -> Result<Task, QueueError> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or(QueueError::TaskNotFound(task_id))
    }

    /// Read, compute, conditionally write; on conflict re-read so the
    /// transition is validated against the newest version.
    async fn transition<F>(&self, task_id: TaskId, step: F) -> Result<Task, QueueError>
    where
        F: Fn(&Task, DateTime<Utc>) -> Result<Task, QueueError> + Send + Sync,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load(task_id).await?;
            let next = step(&current, self.clock.now())?;
            match self.tasks.swap(Expected::of(&current), &next, false).await? {
                CasOutcome::Applied => return Ok(next),
                CasOutcome::Conflict => {
                    tracing::debug!(task_id = %task_id, "concurrent update, retrying transition");
                }
            }
        }
        Err(QueueError::Conflict(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, NewTask, Capabilities};
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    const LEASE: Duration = Duration::from_secs(30);

    struct Fixture {
        leases: LeaseManager,
        store: Arc<InMemoryStore>,
        clock: FixedClock,
    }

    async fn fixture() -> Fixture {
        let clock = FixedClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let store = Arc::new(InMemoryStore::new());
        for w in ["a", "b"] {
            store
                .upsert(&WorkerId::new(w).unwrap(), &Capabilities::new(), clock.now())
                .await
                .unwrap();
        }
        let leases = LeaseManager::new(
            store.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(DefaultDecider::default()),
            Arc::new(Notify::new()),
        );
        Fixture { leases, store, clock }
    }

    async fn seed(f: &Fixture, max_attempts: u32) -> TaskId {
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new("t", json!({}), 0).with_max_attempts(max_attempts),
            3,
            f.clock.now(),
        );
        f.store.insert(&task).await.unwrap();
        task.id
    }

    fn w(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    #[tokio::test]
    async fn second_claim_is_already_claimed() {
        let f = fixture().await;
        let id = seed(&f, 3).await;

        f.leases.claim(id, &w("a"), LEASE).await.unwrap();
        assert!(matches!(
            f.leases.claim(id, &w("b"), LEASE).await,
            Err(QueueError::AlreadyClaimed(_))
        ));
    }

    #[tokio::test]
    async fn stale_read_loses_the_swap() {
        let f = fixture().await;
        let id = seed(&f, 3).await;
        let snapshot = TaskStore::get(f.store.as_ref(), id).await.unwrap().unwrap();

        f.leases.claim_observed(&snapshot, &w("a"), LEASE).await.unwrap();
        assert!(matches!(
            f.leases.claim_observed(&snapshot, &w("b"), LEASE).await,
            Err(QueueError::AlreadyClaimed(_))
        ));
    }

    #[tokio::test]
    async fn claim_requires_registered_worker() {
        let f = fixture().await;
        let id = seed(&f, 3).await;
        assert!(matches!(
            f.leases.claim(id, &w("ghost"), LEASE).await,
            Err(QueueError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn worker_holds_one_lease_at_a_time() {
        let f = fixture().await;
        let first = seed(&f, 3).await;
        let second = seed(&f, 3).await;

        f.leases.claim(first, &w("a"), LEASE).await.unwrap();
        assert!(matches!(
            f.leases.claim(second, &w("a"), LEASE).await,
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn full_success_path() {
        let f = fixture().await;
        let id = seed(&f, 3).await;

        f.leases.claim(id, &w("a"), LEASE).await.unwrap();
        f.leases.mark_running(id, &w("a")).await.unwrap();
        f.clock.advance(Duration::from_secs(20));
        let renewed = f.leases.renew(id, &w("a"), LEASE).await.unwrap();
        assert_eq!(
            renewed.lease_expires_at,
            Some(f.clock.now() + chrono::Duration::seconds(30))
        );

        let done = f
            .leases
            .release(id, &w("a"), Outcome::success(json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"n": 1})));
        assert!(f.store.held_by(&w("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_holder_cannot_release_reassigned_task() {
        let f = fixture().await;
        let id = seed(&f, 3).await;

        let claimed = f.leases.claim(id, &w("a"), LEASE).await.unwrap();
        f.clock.advance(Duration::from_secs(31));
        f.leases
            .revoke(&claimed, "lease expired", f.clock.now())
            .await
            .unwrap()
            .unwrap();
        f.leases.claim(id, &w("b"), LEASE).await.unwrap();

        assert!(matches!(
            f.leases.release(id, &w("a"), Outcome::success_empty()).await,
            Err(QueueError::NotLeaseHolder { .. })
        ));
        let task = TaskStore::get(f.store.as_ref(), id).await.unwrap().unwrap();
        assert_eq!(task.lease_holder, Some(w("b")));
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn revoke_after_release_is_a_no_op() {
        let f = fixture().await;
        let id = seed(&f, 3).await;

        let claimed = f.leases.claim(id, &w("a"), LEASE).await.unwrap();
        f.leases
            .release(id, &w("a"), Outcome::failure("boom"))
            .await
            .unwrap();
        assert!(
            f.leases
                .revoke(&claimed, "lease expired", f.clock.now())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn failures_exhaust_max_attempts() {
        let f = fixture().await;
        let id = seed(&f, 2).await;

        for _ in 0..2 {
            f.leases.claim(id, &w("a"), LEASE).await.unwrap();
            f.leases
                .release(id, &w("a"), Outcome::failure("boom"))
                .await
                .unwrap();
        }
        let task = TaskStore::get(f.store.as_ref(), id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
    }
}
