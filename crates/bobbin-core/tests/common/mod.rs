#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bobbin_core::domain::{Capabilities, Task};
use bobbin_core::impls::{InMemoryStore, SqliteStore};
use bobbin_core::ports::FixedClock;
use bobbin_core::{Engine, EngineBuilder, EngineConfig, WorkerId};
use chrono::{TimeZone, Utc};

pub const LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub fn clock() -> FixedClock {
    FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
}

pub fn config() -> EngineConfig {
    EngineConfig {
        default_lease: LEASE,
        max_attempts: 3,
        worker_liveness: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        reap_dead_workers: false,
        ..Default::default()
    }
}

pub async fn engine(backend: Backend, clock: &FixedClock, config: EngineConfig) -> Arc<Engine> {
    let builder = EngineBuilder::new().config(config).with_clock(clock.clone());
    let builder = match backend {
        Backend::Memory => builder.with_stores(Arc::new(InMemoryStore::new())),
        Backend::Sqlite => builder.with_stores(Arc::new(
            SqliteStore::connect("sqlite::memory:").await.unwrap(),
        )),
    };
    Arc::new(builder.build().unwrap())
}

pub async fn worker(engine: &Engine, name: &str, tags: &[&str]) -> WorkerId {
    let id = WorkerId::new(name).unwrap();
    let caps: Capabilities = tags.iter().map(|t| t.to_string()).collect();
    engine.register_worker(&id, caps).await.unwrap();
    id
}

/// Every task agrees with the lease invariant, and every worker's derived
/// current task agrees with the task-side holder.
pub async fn assert_consistent(engine: &Engine) {
    let tasks: Vec<Task> = engine.list_tasks(&Default::default()).await.unwrap();
    for task in &tasks {
        assert!(task.lease_is_consistent(), "inconsistent lease on {task:?}");
    }
    for w in engine.list_workers().await.unwrap() {
        let held: Vec<_> = tasks
            .iter()
            .filter(|t| t.lease_holder.as_ref() == Some(&w.id))
            .map(|t| t.id)
            .collect();
        assert!(held.len() <= 1, "worker {} holds {held:?}", w.id);
        assert_eq!(w.current_task, held.first().copied());
    }
}
