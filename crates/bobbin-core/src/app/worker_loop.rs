//! WorkerLoop - in-process workers
//!
//! # フロー
//! 1. register（capabilities を申告）
//! 2. poll（long-poll、shutdown と select で競合させる）
//! 3. mark_running
//! 4. handler 実行中は lease の半分ごとに renew
//! 5. 結果で release（成功: completed / 失敗: requeue or failed は Decider 側）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::Engine;
use crate::domain::{Capabilities, QueueError, Task, TaskStatus, WorkerId};

/// Failure reported by a handler; becomes the task's `last_error`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

/// A handler for tasks with a given name.
///
/// Delivery is at-least-once: a task may run again after a lease is lost, so
/// handlers should be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `Ok(result)` completes the task with the optional result document.
    async fn handle(&self, task: &Task) -> Result<Option<serde_json::Value>, HandlerError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a handler is already registered for task `{0}`")]
    DuplicateHandler(String),
}

/// Registry of handlers (task name -> handler).
///
/// Built during initialization, read-only once workers run.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateHandler(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Identity of one in-process worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub capabilities: Capabilities,
}

impl WorkerSpec {
    pub fn new<I, S>(id: WorkerId, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

/// Worker group handle.
/// - `request_shutdown()` で新しい lease の取得を止める
/// - `shutdown_and_join()` で全ワーカーの終了を待てる（実行中の handler は最後まで走る）
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(engine: Arc<Engine>, handlers: Arc<HandlerRegistry>, specs: Vec<WorkerSpec>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = specs
            .into_iter()
            .map(|spec| {
                let engine = Arc::clone(&engine);
                let handlers = Arc::clone(&handlers);
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(engine, handlers, spec, &mut rx).await;
                })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(
    engine: Arc<Engine>,
    handlers: Arc<HandlerRegistry>,
    spec: WorkerSpec,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let WorkerSpec { id, capabilities } = spec;
    let retry_pause = engine.config().poll_interval;
    let poll_timeout = engine.config().max_poll_timeout;

    if let Err(e) = engine.register_worker(&id, capabilities.clone()).await {
        tracing::error!(worker_id = %id, error = %e, "worker registration failed");
        return;
    }

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // poll は待つ可能性があるので shutdown と競合させる
        let polled = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            polled = engine.poll(&id, Some(capabilities.clone()), poll_timeout) => polled,
        };

        match polled {
            Ok(Some(task)) => run_task(&engine, &handlers, &id, task).await,
            Ok(None) => {}
            Err(QueueError::UnknownWorker(_)) => {
                tracing::warn!(worker_id = %id, "worker record missing, re-registering");
                if let Err(e) = engine.register_worker(&id, capabilities.clone()).await {
                    tracing::warn!(worker_id = %id, error = %e, "re-registration failed");
                    tokio::time::sleep(retry_pause).await;
                }
            }
            Err(e) => {
                tracing::warn!(worker_id = %id, error = %e, "poll failed");
                tokio::time::sleep(retry_pause).await;
            }
        }
    }
    tracing::debug!(worker_id = %id, "worker stopped");
}

async fn run_task(engine: &Engine, handlers: &HandlerRegistry, worker: &WorkerId, task: Task) {
    let task = if task.status == TaskStatus::Claimed {
        match engine.mark_running(task.id, worker).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %task.id, worker_id = %worker, error = %e, "mark running failed");
                return;
            }
        }
    } else {
        task
    };

    let Some(handler) = handlers.get(&task.name) else {
        let reason = format!("no handler registered for task `{}`", task.name);
        if let Err(e) = engine.fail(task.id, worker, reason).await {
            tracing::warn!(task_id = %task.id, error = %e, "fail report failed");
        }
        return;
    };

    let Some(result) = run_with_renewal(engine, handler.as_ref(), worker, &task).await else {
        return;
    };

    let released = match result {
        Ok(value) => engine.complete(task.id, worker, value).await,
        Err(err) => engine.fail(task.id, worker, err.to_string()).await,
    };
    if let Err(e) = released {
        tracing::warn!(task_id = %task.id, worker_id = %worker, error = %e, "release failed");
    }
}

/// Run the handler, renewing the lease every half lease. `None` when the lease
/// was lost mid-run; the result is then discarded since another worker may
/// already own the task.
async fn run_with_renewal(
    engine: &Engine,
    handler: &dyn TaskHandler,
    worker: &WorkerId,
    task: &Task,
) -> Option<Result<Option<serde_json::Value>, HandlerError>> {
    let every = renew_period(engine.config().default_lease);
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let work = handler.handle(task);
    tokio::pin!(work);

    loop {
        tokio::select! {
            result = &mut work => return Some(result),
            _ = ticker.tick() => {
                match engine.renew(task.id, worker, None).await {
                    Ok(_) => {}
                    Err(e) if e.is_contention() => {
                        tracing::warn!(task_id = %task.id, worker_id = %worker, error = %e, "lease lost, abandoning task");
                        return None;
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, worker_id = %worker, error = %e, "lease renewal failed");
                    }
                }
            }
        }
    }
}

fn renew_period(lease: Duration) -> Duration {
    (lease / 2).max(Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::EngineBuilder;
    use crate::config::EngineConfig;
    use crate::domain::NewTask;
    use crate::impls::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then echoes the payload.
    struct FlakyEcho {
        failures: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for FlakyEcho {
        async fn handle(&self, task: &Task) -> Result<Option<serde_json::Value>, HandlerError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(format!("intentional failure (left={left})").into());
            }
            Ok(Some(task.payload.clone()))
        }
    }

    struct Slow;

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _task: &Task) -> Result<Option<serde_json::Value>, HandlerError> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(None)
        }
    }

    fn engine(lease: Duration) -> Arc<Engine> {
        Arc::new(
            EngineBuilder::new()
                .config(EngineConfig {
                    default_lease: lease,
                    poll_interval: Duration::from_millis(10),
                    max_poll_timeout: Duration::from_millis(100),
                    ..Default::default()
                })
                .with_stores(Arc::new(InMemoryStore::new()))
                .build()
                .unwrap(),
        )
    }

    async fn wait_terminal(engine: &Engine, task: &Task) -> Task {
        for _ in 0..200 {
            let current = engine.get_task(task.id).await.unwrap();
            if current.status.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", task.id);
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Slow)).unwrap();
        assert!(matches!(
            registry.register("echo", Arc::new(Slow)),
            Err(RegistryError::DuplicateHandler(name)) if name == "echo"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn worker_retries_until_success() {
        let engine = engine(Duration::from_secs(30));
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", Arc::new(FlakyEcho { failures: AtomicU32::new(2) }))
            .unwrap();

        let group = WorkerGroup::spawn(
            engine.clone(),
            Arc::new(registry),
            vec![WorkerSpec::new(WorkerId::new("w1").unwrap(), Vec::<String>::new())],
        );
        let task = engine
            .create_task(NewTask::new("echo", json!({"hello": "bobbin"}), 0))
            .await
            .unwrap();

        let done = wait_terminal(&engine, &task).await;
        group.shutdown_and_join().await;

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempts, 3);
        assert_eq!(done.result, Some(json!({"hello": "bobbin"})));
    }

    #[tokio::test]
    async fn missing_handler_fails_the_attempt() {
        let engine = engine(Duration::from_secs(30));
        let group = WorkerGroup::spawn(
            engine.clone(),
            Arc::new(HandlerRegistry::new()),
            vec![WorkerSpec::new(WorkerId::new("w1").unwrap(), Vec::<String>::new())],
        );
        let task = engine
            .create_task(NewTask::new("unknown", json!({}), 0).with_max_attempts(1))
            .await
            .unwrap();

        let done = wait_terminal(&engine, &task).await;
        group.shutdown_and_join().await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.last_error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn long_handler_keeps_its_lease() {
        // lease shorter than the handler; renewal keeps it alive
        let engine = engine(Duration::from_millis(80));
        let mut registry = HandlerRegistry::new();
        registry.register("slow", Arc::new(Slow)).unwrap();

        let group = WorkerGroup::spawn(
            engine.clone(),
            Arc::new(registry),
            vec![WorkerSpec::new(WorkerId::new("w1").unwrap(), Vec::<String>::new())],
        );
        let task = engine
            .create_task(NewTask::new("slow", json!({}), 0))
            .await
            .unwrap();

        let done = wait_terminal(&engine, &task).await;
        group.shutdown_and_join().await;

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempts, 1);
    }
}
