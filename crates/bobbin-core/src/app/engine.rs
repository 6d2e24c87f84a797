//! Engine - the facade the transport layer and in-process workers talk to.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::reaper_loop::Reaper;
use super::status::QueueStatus;
use crate::config::EngineConfig;
use crate::domain::{
    Capabilities, NewTask, Outcome, QueueError, Task, TaskFilter, TaskId, Worker, WorkerId,
};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::queue::{Dispatcher, LeaseManager, WorkerRegistry};

/// Built by [`EngineBuilder`](super::EngineBuilder). Cheap to share behind an `Arc`.
pub struct Engine {
    pub(super) tasks: Arc<dyn TaskStore>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) registry: Arc<WorkerRegistry>,
    pub(super) leases: Arc<LeaseManager>,
    pub(super) dispatcher: Dispatcher,
    pub(super) availability: Arc<Notify>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ---- tasks ----

    /// Validate and persist a submission as a fresh `pending` task.
    pub async fn create_task(&self, submission: NewTask) -> Result<Task, QueueError> {
        submission.validate()?;
        let task = Task::new(
            self.ids.generate_task_id(),
            submission,
            self.config.max_attempts,
            self.clock.now(),
        );
        self.tasks.insert(&task).await?;
        tracing::info!(
            task_id = %task.id,
            name = %task.name,
            priority = task.priority,
            "task created"
        );
        self.availability.notify_waiters();
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, QueueError> {
        self.tasks.get(id).await?.ok_or(QueueError::TaskNotFound(id))
    }

    /// Priority ascending, then oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        Ok(self.tasks.list(filter).await?)
    }

    /// Remove a task. A lease held on it goes with the row.
    pub async fn delete_task(&self, id: TaskId) -> Result<Task, QueueError> {
        let removed = self.tasks.delete(id).await?.ok_or(QueueError::TaskNotFound(id))?;
        match &removed.lease_holder {
            Some(holder) => tracing::info!(task_id = %id, worker_id = %holder, "task deleted, lease dropped"),
            None => tracing::info!(task_id = %id, "task deleted"),
        }
        Ok(removed)
    }

    // ---- workers ----

    pub async fn register_worker(&self, id: &WorkerId, capabilities: Capabilities) -> Result<Worker, QueueError> {
        self.registry.register(id, capabilities).await
    }

    pub async fn heartbeat(&self, id: &WorkerId) -> Result<(), QueueError> {
        self.registry.heartbeat(id).await
    }

    pub async fn get_worker(&self, id: &WorkerId) -> Result<Worker, QueueError> {
        self.registry.get(id).await
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>, QueueError> {
        self.registry.list_workers().await
    }

    // ---- dispatch ----

    /// Single scheduling attempt. `Ok(None)` is `NoWorkAvailable`.
    pub async fn request_work(&self, worker: &WorkerId, capabilities: &Capabilities) -> Result<Option<Task>, QueueError> {
        self.dispatcher.request_work(worker, capabilities).await
    }

    /// Long-poll for work.
    ///
    /// Without explicit capabilities the worker's registered ones are used. A
    /// zero timeout makes a single attempt.
    pub async fn poll(
        &self,
        worker: &WorkerId,
        capabilities: Option<Capabilities>,
        timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let capabilities = match capabilities {
            Some(caps) => caps,
            None => self.registry.record(worker).await?.capabilities,
        };
        self.dispatcher.poll(worker, &capabilities, timeout).await
    }

    /// Claim a specific task. `lease` defaults to the configured lease.
    pub async fn claim(&self, task: TaskId, worker: &WorkerId, lease: Option<Duration>) -> Result<Task, QueueError> {
        self.leases
            .claim(task, worker, lease.unwrap_or(self.config.default_lease))
            .await
    }

    pub async fn mark_running(&self, task: TaskId, worker: &WorkerId) -> Result<Task, QueueError> {
        self.leases.mark_running(task, worker).await
    }

    /// `extension` defaults to the configured lease.
    pub async fn renew(&self, task: TaskId, worker: &WorkerId, extension: Option<Duration>) -> Result<Task, QueueError> {
        self.leases
            .renew(task, worker, extension.unwrap_or(self.config.default_lease))
            .await
    }

    pub async fn release(&self, task: TaskId, worker: &WorkerId, outcome: Outcome) -> Result<Task, QueueError> {
        self.leases.release(task, worker, outcome).await
    }

    pub async fn complete(
        &self,
        task: TaskId,
        worker: &WorkerId,
        result: Option<serde_json::Value>,
    ) -> Result<Task, QueueError> {
        self.release(task, worker, Outcome::Success { result }).await
    }

    pub async fn fail(&self, task: TaskId, worker: &WorkerId, reason: impl Into<String>) -> Result<Task, QueueError> {
        self.release(task, worker, Outcome::failure(reason)).await
    }

    // ---- status ----

    pub async fn queue_status(&self) -> Result<QueueStatus, QueueError> {
        let now = self.clock.now();
        let counts = self.tasks.counts().await?;
        let (workers_alive, workers_dead) = self.registry.liveness_counts(now).await?;
        Ok(QueueStatus::new(counts, workers_alive, workers_dead))
    }

    /// A reaper sharing this engine's stores and retry policy.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.tasks.clone(),
            self.registry.clone(),
            self.leases.clone(),
            self.config.reaper_batch,
            self.config.reap_dead_workers,
        )
    }
}
