//! Queue module: the dispatch engine.
//!
//! - `lifecycle`: pure status transitions
//! - `lease`: claim / renew / release through conditional writes
//! - `registry`: worker records and liveness
//! - `scheduler`: candidate scan and long-poll
//! - `retry`: backoff policy for requeued tasks

pub mod lifecycle;
mod lease;
mod registry;
mod retry;
mod scheduler;

pub use lease::{LEASE_EXPIRED, LeaseManager};
pub use registry::WorkerRegistry;
pub use retry::RetryPolicy;
pub use scheduler::{DispatchSettings, Dispatcher};
