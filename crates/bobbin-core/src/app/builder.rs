//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! 起動時検証（Fail-fast）: 設定値とストアの有無を build() でチェックし、
//! 問題があれば BuildError を返す。

use std::sync::Arc;

use tokio::sync::Notify;

use super::Engine;
use crate::config::EngineConfig;
use crate::domain::{Decider, DefaultDecider};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator, WorkerStore};
use crate::queue::{DispatchSettings, Dispatcher, LeaseManager, WorkerRegistry};

/// EngineBuilder はエンジンを構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(config)
///     .with_stores(Arc::new(InMemoryStore::new()))
///     .build()?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    tasks: Option<Arc<dyn TaskStore>>,
    workers: Option<Arc<dyn WorkerStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    #[error("no {0} configured")]
    MissingStore(&'static str),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// One backend for both tasks and workers.
    pub fn with_stores<S>(self, store: Arc<S>) -> Self
    where
        S: TaskStore + WorkerStore + 'static,
    {
        self.with_task_store(store.clone()).with_worker_store(store)
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(store);
        self
    }

    pub fn with_worker_store(mut self, store: Arc<dyn WorkerStore>) -> Self {
        self.workers = Some(store);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Defaults to ULIDs stamped from the engine clock.
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    /// Defaults to [`DefaultDecider`] over the configured retry policy.
    pub fn with_decider(mut self, decider: impl Decider + 'static) -> Self {
        self.decider = Some(Arc::new(decider));
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;
        let tasks = self.tasks.ok_or(BuildError::MissingStore("task store"))?;
        let workers = self.workers.ok_or(BuildError::MissingStore("worker store"))?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry.clone())));
        let availability = Arc::new(Notify::new());

        let registry = Arc::new(WorkerRegistry::new(
            workers.clone(),
            tasks.clone(),
            clock.clone(),
            self.config.worker_liveness,
        ));
        let leases = Arc::new(LeaseManager::new(
            tasks.clone(),
            workers,
            clock.clone(),
            decider,
            availability.clone(),
        ));
        let dispatcher = Dispatcher::new(
            tasks.clone(),
            registry.clone(),
            leases.clone(),
            clock.clone(),
            availability.clone(),
            DispatchSettings {
                lease: self.config.default_lease,
                scan_depth: self.config.scan_depth,
                poll_interval: self.config.poll_interval,
                max_poll_timeout: self.config.max_poll_timeout,
            },
        );

        tracing::debug!(config = ?self.config, "engine built");
        Ok(Engine {
            tasks,
            clock,
            ids,
            registry,
            leases,
            dispatcher,
            availability,
            config: self.config,
        })
    }
}
