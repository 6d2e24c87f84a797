//! HTTP surface over the dispatch engine.

mod error;
mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use bobbin_core::Engine;

pub use self::error::ApiError;

/// Application state shared across handlers.
pub type AppState = Arc<Engine>;

/// Create the router with all routes.
pub fn create_router(engine: AppState) -> Router {
    Router::new()
        .route("/tasks", post(handlers::create_task).get(handlers::list_tasks))
        .route("/tasks/:id", get(handlers::get_task).delete(handlers::delete_task))
        .route("/tasks/:id/running", post(handlers::mark_running))
        .route("/tasks/:id/renew", post(handlers::renew))
        .route("/tasks/:id/complete", post(handlers::complete))
        .route("/tasks/:id/fail", post(handlers::fail))
        .route("/queue/status", get(handlers::queue_status))
        .route("/workers", get(handlers::list_workers))
        .route("/workers/register", post(handlers::register_worker))
        .route("/workers/:id/heartbeat", post(handlers::heartbeat))
        .route("/workers/:id/poll", post(handlers::poll))
        .with_state(engine)
}
