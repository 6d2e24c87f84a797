//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: 開発用・テスト用、単一プロセス向け
//! - **SqliteStore**: 永続化用（sqlx）。複数のスケジューラが同じ DB を共有できる
//!
//! どちらも TaskStore と WorkerStore の両方を実装します。

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryStore;
pub use self::sqlite::SqliteStore;
