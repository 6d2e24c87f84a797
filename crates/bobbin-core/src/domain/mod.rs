//! Domain model (IDs, tasks, workers, outcomes, decisions, errors).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;
pub mod worker;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, QueueError};
pub use ids::{IdError, TaskId, WorkerId};
pub use outcome::Outcome;
pub use state::{ParseStatusError, TaskStatus};
pub use task::{NewTask, Task, TaskFilter};
pub use worker::{Capabilities, Worker, WorkerRecord};
