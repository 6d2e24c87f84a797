//! bobbin-core
//!
//! Core of the bobbin task queue: a durable, priority-aware dispatch engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, worker, state, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, WorkerStore, Clock, IdGenerator）
//! - **impls**: ports の実装（InMemoryStore, SqliteStore）
//! - **queue**: dispatch engine（lifecycle, lease, registry, scheduler, retry）
//! - **app**: 表面（EngineBuilder, Engine, ReaperLoop, WorkerGroup, QueueStatus）
//! - **config**: EngineConfig
//!
//! All correctness under concurrent claims rests on `TaskStore::swap`: every
//! transition is a conditional write keyed on the version the caller read, so
//! any number of engines may share one store.

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::{Engine, EngineBuilder};
pub use config::EngineConfig;
pub use domain::{NewTask, Outcome, QueueError, Task, TaskFilter, TaskId, TaskStatus, Worker, WorkerId};
