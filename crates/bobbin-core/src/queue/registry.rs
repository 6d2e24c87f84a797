//! Worker registry: the only writer of worker records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{Capabilities, QueueError, TaskId, Worker, WorkerId, WorkerRecord};
use crate::ports::{Clock, TaskStore, WorkerStore};

pub struct WorkerRegistry {
    workers: Arc<dyn WorkerStore>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    liveness: Duration,
}

impl WorkerRegistry {
    pub fn new(
        workers: Arc<dyn WorkerStore>,
        tasks: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        liveness: Duration,
    ) -> Self {
        Self {
            workers,
            tasks,
            clock,
            liveness,
        }
    }

    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    /// Idempotent: re-registering replaces capabilities and refreshes the heartbeat.
    pub async fn register(&self, id: &WorkerId, capabilities: Capabilities) -> Result<Worker, QueueError> {
        let now = self.clock.now();
        let record = self.workers.upsert(id, &capabilities, now).await?;
        let current = self.tasks.held_by(id).await?.map(|t| t.id);
        tracing::info!(worker_id = %id, capabilities = ?record.capabilities, "worker registered");
        Ok(Worker::from_record(record, current, now, self.liveness))
    }

    pub async fn heartbeat(&self, id: &WorkerId) -> Result<(), QueueError> {
        if self.workers.touch(id, self.clock.now()).await? {
            Ok(())
        } else {
            Err(QueueError::UnknownWorker(id.clone()))
        }
    }

    /// Stored record, or `UnknownWorker`.
    pub async fn record(&self, id: &WorkerId) -> Result<WorkerRecord, QueueError> {
        self.workers
            .get(id)
            .await?
            .ok_or_else(|| QueueError::UnknownWorker(id.clone()))
    }

    pub async fn get(&self, id: &WorkerId) -> Result<Worker, QueueError> {
        let Some(record) = self.workers.get(id).await? else {
            return Err(QueueError::WorkerNotFound(id.clone()));
        };
        let current = self.tasks.held_by(id).await?.map(|t| t.id);
        Ok(Worker::from_record(record, current, self.clock.now(), self.liveness))
    }

    /// All workers, ordered by id, with `current_task` joined from the task store.
    pub async fn list_workers(&self) -> Result<Vec<Worker>, QueueError> {
        let now = self.clock.now();
        let records = self.workers.list().await?;
        let held: HashMap<WorkerId, TaskId> = self
            .tasks
            .leases_held()
            .await?
            .into_iter()
            .filter_map(|t| t.lease_holder.map(|holder| (holder, t.id)))
            .collect();

        Ok(records
            .into_iter()
            .map(|record| {
                let current = held.get(&record.id).copied();
                Worker::from_record(record, current, now, self.liveness)
            })
            .collect())
    }

    pub fn is_alive(worker: &WorkerRecord, now: DateTime<Utc>, threshold: Duration) -> bool {
        worker.is_alive(now, threshold)
    }

    /// `(alive, dead)` worker counts at `now`.
    pub async fn liveness_counts(&self, now: DateTime<Utc>) -> Result<(u64, u64), QueueError> {
        let records = self.workers.list().await?;
        let alive = records
            .iter()
            .filter(|r| Self::is_alive(r, now, self.liveness))
            .count() as u64;
        Ok((alive, records.len() as u64 - alive))
    }

    /// Ids of workers past the liveness threshold.
    pub async fn dead_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerId>, QueueError> {
        Ok(self
            .workers
            .list()
            .await?
            .into_iter()
            .filter(|r| !Self::is_alive(r, now, self.liveness))
            .map(|r| r.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn setup() -> (WorkerRegistry, FixedClock) {
        let clock = FixedClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let store = Arc::new(InMemoryStore::new());
        let registry = WorkerRegistry::new(
            store.clone(),
            store,
            Arc::new(clock.clone()),
            Duration::from_secs(30),
        );
        (registry, clock)
    }

    fn caps(tags: &[&str]) -> Capabilities {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (registry, _) = setup();
        let id = WorkerId::new("w1").unwrap();

        registry.register(&id, caps(&["gpu"])).await.unwrap();
        let again = registry.register(&id, caps(&["cpu"])).await.unwrap();

        assert_eq!(again.capabilities, caps(&["cpu"]));
        assert!(again.alive);
        assert_eq!(again.current_task, None);
        assert_eq!(registry.list_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_requires_registration() {
        let (registry, _) = setup();
        let id = WorkerId::new("ghost").unwrap();
        assert!(matches!(
            registry.heartbeat(&id).await,
            Err(QueueError::UnknownWorker(_))
        ));

        registry.register(&id, Capabilities::new()).await.unwrap();
        registry.heartbeat(&id).await.unwrap();
    }

    #[tokio::test]
    async fn liveness_follows_the_clock() {
        let (registry, clock) = setup();
        registry
            .register(&WorkerId::new("w1").unwrap(), Capabilities::new())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        registry
            .register(&WorkerId::new("w2").unwrap(), Capabilities::new())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(25));
        assert_eq!(registry.liveness_counts(clock.now()).await.unwrap(), (1, 1));
        assert_eq!(
            registry.dead_workers(clock.now()).await.unwrap(),
            vec![WorkerId::new("w1").unwrap()]
        );

        let listed = registry.list_workers().await.unwrap();
        assert!(!listed[0].alive);
        assert!(listed[1].alive);
    }
}
