//! Request handlers. Each one parses, calls the engine, and shapes the reply.

use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bobbin_core::domain::Capabilities;
use bobbin_core::{NewTask, Task, TaskFilter, TaskId, TaskStatus, Worker, WorkerId};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ApiError, AppState};

type ApiResult<T> = Result<T, ApiError>;

/// `Json<T>` whose rejections use the service's error body.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| JsonBody(value))
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
    }
}

fn task_id(raw: &str) -> ApiResult<TaskId> {
    raw.parse().map_err(|e| ApiError::bad_request(format!("{e}")))
}

fn worker_id(raw: &str) -> ApiResult<WorkerId> {
    WorkerId::new(raw).map_err(|e| ApiError::bad_request(format!("{e}")))
}

// ---- tasks ----

pub async fn create_task(
    State(engine): State<AppState>,
    JsonBody(submission): JsonBody<NewTask>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = engine.create_task(submission).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    priority: Option<String>,
}

impl ListQuery {
    fn filter(&self) -> ApiResult<TaskFilter> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                raw.parse::<TaskStatus>()
                    .map_err(|e| ApiError::bad_request(e.to_string()))?,
            ),
            None => None,
        };
        let priority = match self.priority.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<i32>()
                    .map_err(|_| ApiError::bad_request(format!("invalid priority `{raw}`")))?,
            ),
            None => None,
        };
        Ok(TaskFilter { status, priority })
    }
}

pub async fn list_tasks(
    State(engine): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let tasks = engine.list_tasks(&query.filter()?).await?;
    Ok(Json(tasks))
}

pub async fn get_task(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    Ok(Json(engine.get_task(task_id(&id)?).await?))
}

pub async fn delete_task(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    engine.delete_task(task_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- worker-scoped task calls ----

#[derive(Debug, Deserialize)]
pub struct HolderRequest {
    worker_id: WorkerId,
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    worker_id: WorkerId,
    #[serde(default)]
    extension_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    worker_id: WorkerId,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    worker_id: WorkerId,
    #[serde(default)]
    reason: Option<String>,
}

const DEFAULT_FAILURE_REASON: &str = "worker reported failure";

pub async fn mark_running(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<HolderRequest>,
) -> ApiResult<Json<Task>> {
    Ok(Json(engine.mark_running(task_id(&id)?, &req.worker_id).await?))
}

pub async fn renew(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<RenewRequest>,
) -> ApiResult<Json<Task>> {
    let extension = req.extension_ms.map(Duration::from_millis);
    if extension.is_some_and(|d| d.is_zero()) {
        return Err(ApiError::bad_request("extension_ms must be positive"));
    }
    Ok(Json(engine.renew(task_id(&id)?, &req.worker_id, extension).await?))
}

pub async fn complete(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<CompleteRequest>,
) -> ApiResult<Json<Task>> {
    Ok(Json(engine.complete(task_id(&id)?, &req.worker_id, req.result).await?))
}

pub async fn fail(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<FailRequest>,
) -> ApiResult<Json<Task>> {
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());
    Ok(Json(engine.fail(task_id(&id)?, &req.worker_id, reason).await?))
}

// ---- workers ----

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(alias = "workerId")]
    worker_id: WorkerId,
    #[serde(default)]
    capabilities: Capabilities,
}

pub async fn register_worker(
    State(engine): State<AppState>,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(engine.register_worker(&req.worker_id, req.capabilities).await?))
}

pub async fn list_workers(State(engine): State<AppState>) -> ApiResult<Json<Vec<Worker>>> {
    Ok(Json(engine.list_workers().await?))
}

pub async fn heartbeat(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    engine.heartbeat(&worker_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct PollRequest {
    #[serde(default)]
    capabilities: Option<Capabilities>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Long-poll. The body is optional; without one the worker's registered
/// capabilities are used and a single attempt is made.
pub async fn poll(State(engine): State<AppState>, Path(id): Path<String>, body: Bytes) -> ApiResult<Response> {
    let worker = worker_id(&id)?;
    let req: PollRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PollRequest::default()
    } else {
        parse_body(&body)?
    };
    let timeout = Duration::from_millis(req.timeout_ms.unwrap_or(0));

    Ok(match engine.poll(&worker, req.capabilities, timeout).await? {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))
}

// ---- status ----

pub async fn queue_status(State(engine): State<AppState>) -> ApiResult<Response> {
    Ok(Json(engine.queue_status().await?).into_response())
}
