//! In-memory store implementation.
//!
//! One mutex guards tasks and workers together; every trait method completes
//! inside a single critical section, so `swap` is atomic and the lock is never
//! held across an await point.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Capabilities, Task, TaskFilter, TaskId, WorkerId, WorkerRecord};
use crate::ports::{CasOutcome, Expected, StatusCounts, StoreError, TaskStore, WorkerStore};

/// Stored task plus its insertion sequence (final ordering tie-break).
#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Slot>,
    workers: HashMap<WorkerId, WorkerRecord>,
    next_seq: u64,
}

impl MemoryState {
    /// Matching tasks in queue order.
    fn ordered(&self, pred: impl Fn(&Task) -> bool) -> Vec<&Slot> {
        let mut slots: Vec<&Slot> = self.tasks.values().filter(|s| pred(&s.task)).collect();
        slots.sort_by(|a, b| a.task.queue_cmp(&b.task).then(a.seq.cmp(&b.seq)));
        slots
    }

    fn holder_busy_elsewhere(&self, holder: &WorkerId, task_id: TaskId) -> bool {
        self.tasks
            .values()
            .any(|s| s.task.id != task_id && s.task.lease_holder.as_ref() == Some(holder))
    }
}

/// Store for development, tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            task.id,
            Slot {
                seq,
                task: task.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).map(|s| s.task.clone()))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ordered(|t| filter.matches(t))
            .into_iter()
            .map(|s| s.task.clone())
            .collect())
    }

    async fn pending_candidates(
        &self,
        now: DateTime<Utc>,
        capabilities: &Capabilities,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ordered(|t| t.is_claimable(now) && t.satisfied_by(capabilities))
            .into_iter()
            .take(limit)
            .map(|s| s.task.clone())
            .collect())
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut expired: Vec<&Slot> = state
            .tasks
            .values()
            .filter(|s| s.task.status.holds_lease() && s.task.lease_expired(now))
            .collect();
        expired.sort_by_key(|s| (s.task.lease_expires_at, s.seq));
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|s| s.task.clone())
            .collect())
    }

    async fn leases_held(&self) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ordered(|t| t.status.holds_lease())
            .into_iter()
            .map(|s| s.task.clone())
            .collect())
    }

    async fn held_by(&self, worker: &WorkerId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .find(|s| s.task.is_held_by(worker))
            .map(|s| s.task.clone()))
    }

    async fn swap(
        &self,
        expected: Expected,
        next: &Task,
        exclusive_holder: bool,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if exclusive_holder
            && let Some(holder) = &next.lease_holder
            && state.holder_busy_elsewhere(holder, next.id)
        {
            return Ok(CasOutcome::Conflict);
        }

        let Some(slot) = state.tasks.get_mut(&next.id) else {
            return Ok(CasOutcome::Conflict);
        };
        if Expected::of(&slot.task) != expected {
            return Ok(CasOutcome::Conflict);
        }
        slot.task = next.clone();
        Ok(CasOutcome::Applied)
    }

    async fn delete(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.tasks.remove(&id).map(|s| s.task))
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for slot in state.tasks.values() {
            counts.add(slot.task.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl WorkerStore for InMemoryStore {
    async fn upsert(
        &self,
        id: &WorkerId,
        capabilities: &Capabilities,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .workers
            .entry(id.clone())
            .and_modify(|w| {
                w.capabilities = capabilities.clone();
                w.last_heartbeat = w.last_heartbeat.max(now);
            })
            .or_insert_with(|| WorkerRecord {
                id: id.clone(),
                capabilities: capabilities.clone(),
                last_heartbeat: now,
                registered_at: now,
            });
        Ok(record.clone())
    }

    async fn touch(&self, id: &WorkerId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(id) {
            Some(worker) => {
                worker.last_heartbeat = worker.last_heartbeat.max(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.workers.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut workers: Vec<WorkerRecord> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskStatus};
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn task(priority: i32, created: i64) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new("t", json!({}), priority),
            3,
            at(created),
        )
    }

    fn leased(mut t: Task, worker: &str, expires: i64) -> Task {
        t.status = TaskStatus::Claimed;
        t.lease_holder = Some(WorkerId::new(worker).unwrap());
        t.lease_expires_at = Some(at(expires));
        t.revision += 1;
        t
    }

    #[tokio::test]
    async fn list_orders_by_priority_age_then_insertion() {
        let store = InMemoryStore::new();
        let a = task(5, 0);
        let b = task(1, 10);
        let c = task(1, 10); // same priority and timestamp as b, inserted later
        let d = task(1, 5);
        for t in [&a, &b, &c, &d] {
            store.insert(t).await.unwrap();
        }

        let ids: Vec<TaskId> = TaskStore::list(&store, &TaskFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![d.id, b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryStore::new();
        let t = task(0, 0);
        store.insert(&t).await.unwrap();
        assert!(matches!(store.insert(&t).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn swap_requires_matching_revision() {
        let store = InMemoryStore::new();
        let t = task(0, 0);
        store.insert(&t).await.unwrap();

        let next = leased(t.clone(), "w1", 30);
        assert_eq!(
            store.swap(Expected::of(&t), &next, true).await.unwrap(),
            CasOutcome::Applied
        );
        // second writer computed from the same stale read loses
        let rival = leased(t.clone(), "w2", 30);
        assert_eq!(
            store.swap(Expected::of(&t), &rival, true).await.unwrap(),
            CasOutcome::Conflict
        );
        let stored = TaskStore::get(&store, t.id).await.unwrap().unwrap();
        assert_eq!(stored.lease_holder, Some(WorkerId::new("w1").unwrap()));
    }

    #[tokio::test]
    async fn exclusive_swap_refuses_second_lease_for_same_worker() {
        let store = InMemoryStore::new();
        let first = task(0, 0);
        let second = task(0, 1);
        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();

        let held = leased(first.clone(), "w1", 30);
        store.swap(Expected::of(&first), &held, true).await.unwrap();

        let greedy = leased(second.clone(), "w1", 30);
        assert_eq!(
            store.swap(Expected::of(&second), &greedy, true).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(
            store.held_by(&WorkerId::new("w1").unwrap()).await.unwrap().map(|t| t.id),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn candidates_respect_capabilities_and_backoff() {
        let store = InMemoryStore::new();
        let mut gpu = task(0, 0);
        gpu.requires.insert("gpu".into());
        let mut later = task(0, 1);
        later.run_after = Some(at(100));
        let plain = task(1, 2);
        for t in [&gpu, &later, &plain] {
            store.insert(t).await.unwrap();
        }

        let none = Capabilities::new();
        let ids: Vec<_> = store
            .pending_candidates(at(10), &none, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![plain.id]);

        let caps: Capabilities = ["gpu".to_string()].into();
        let ids: Vec<_> = store
            .pending_candidates(at(200), &caps, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![gpu.id, later.id, plain.id]);
    }

    #[tokio::test]
    async fn expired_leases_are_strictly_past_expiry() {
        let store = InMemoryStore::new();
        let t = task(0, 0);
        store.insert(&t).await.unwrap();
        let held = leased(t.clone(), "w1", 30);
        store.swap(Expected::of(&t), &held, false).await.unwrap();

        assert!(store.expired_leases(at(30), 10).await.unwrap().is_empty());
        assert_eq!(store.expired_leases(at(31), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_heartbeat_never_moves_backwards() {
        let store = InMemoryStore::new();
        let id = WorkerId::new("w1").unwrap();
        assert!(!store.touch(&id, at(0)).await.unwrap());

        store.upsert(&id, &Capabilities::new(), at(10)).await.unwrap();
        assert!(store.touch(&id, at(5)).await.unwrap());
        let record = WorkerStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(record.last_heartbeat, at(10));
        assert_eq!(record.registered_at, at(10));
    }
}
