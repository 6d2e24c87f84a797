//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - 状態遷移はすべて TaskStore::swap（条件付き更新）で永続化する
//! - WorkerStore は registry だけが書き込む

pub mod clock;
pub mod id_generator;
pub mod task_store;
pub mod worker_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{CasOutcome, Expected, StatusCounts, StoreError, TaskStore};
pub use self::worker_store::WorkerStore;
