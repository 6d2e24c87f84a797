//! `bobbin demo`: producer + in-process workers over the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bobbin_core::app::{HandlerError, HandlerRegistry, ReaperLoop, TaskHandler, WorkerGroup, WorkerSpec};
use bobbin_core::impls::InMemoryStore;
use bobbin_core::{EngineBuilder, NewTask, Task, WorkerId};
use serde::Deserialize;
use serde_json::json;

use crate::config::DemoArgs;

const HELLO: &str = "hello";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Greets, after failing the first `remaining_failures` calls.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for HelloHandler {
    async fn handle(&self, task: &Task) -> Result<Option<serde_json::Value>, HandlerError> {
        let p: HelloPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| HandlerError::new(format!("json decode: {e}")))?;

        let injected = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1));
        if let Ok(left) = injected {
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }

        println!("Hello, {}! (attempt {})", p.name, task.attempts);
        Ok(Some(json!({ "greeting": format!("Hello, {}!", p.name) })))
    }
}

pub async fn run(args: DemoArgs) -> Result<()> {
    let config = args.engine.to_config();
    let reaper_interval = config.reaper_interval;
    let engine = Arc::new(
        EngineBuilder::new()
            .config(config)
            .with_stores(Arc::new(InMemoryStore::new()))
            .build()
            .context("building engine")?,
    );

    let mut handlers = HandlerRegistry::new();
    handlers.register(HELLO, Arc::new(HelloHandler::new(args.failures)))?;
    let handlers = Arc::new(handlers);

    let specs = (0..args.workers)
        .map(|i| WorkerId::new(format!("demo-worker-{i}")).map(|id| WorkerSpec::new(id, Vec::<String>::new())))
        .collect::<Result<Vec<_>, _>>()?;
    let reaper = ReaperLoop::spawn(engine.clone(), reaper_interval);
    let workers = WorkerGroup::spawn(engine.clone(), handlers, specs);

    for i in 0..args.tasks {
        let task = engine
            .create_task(NewTask::new(HELLO, json!({ "name": format!("bobbin-{i}") }), 0))
            .await?;
        println!("enqueued task: {}", task.id);
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        loop {
            match engine.queue_status().await {
                Ok(status) if status.is_drained() => return Ok(status),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    workers.shutdown_and_join().await;
    reaper.shutdown().await;

    let status = drained.context("demo did not drain in time")??;
    println!(
        "final counts: completed={} failed={}",
        status.counts.completed, status.counts.failed
    );
    for task in engine.list_tasks(&Default::default()).await? {
        println!(
            "  {} status={} attempts={} last_error={:?}",
            task.id, task.status, task.attempts, task.last_error
        );
    }
    Ok(())
}
