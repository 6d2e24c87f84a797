//! App - アプリケーション層
//!
//! ports と queue を組み合わせて、外から使う表面を提供します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング（Fail-fast 検証）
//! - **Engine**: transport 層と in-process worker が呼ぶファサード
//! - **ReaperLoop**: Lease 期限切れ・死んだ worker の回収
//! - **WorkerGroup**: in-process worker（poll→running→handle→release）
//! - **QueueStatus**: 集計ビュー

pub mod builder;
pub mod engine;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::Engine;
pub use self::reaper_loop::{ReapReport, Reaper, ReaperHandle, ReaperLoop};
pub use self::status::QueueStatus;
pub use self::worker_loop::{HandlerError, HandlerRegistry, RegistryError, TaskHandler, WorkerGroup, WorkerSpec};
