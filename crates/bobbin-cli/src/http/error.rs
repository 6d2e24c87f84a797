//! Engine errors as HTTP responses.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bobbin_core::QueueError;
use bobbin_core::domain::ErrorKind;
use serde::Serialize;

/// Seconds a client should wait after a 503.
const RETRY_AFTER_SECS: &str = "1";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Queue(QueueError),
    BadRequest(String),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Queue(err)
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let ApiError::Queue(err) = self else {
            return (StatusCode::BAD_REQUEST, "invalid_request");
        };
        match (err.kind(), err) {
            (_, QueueError::TaskNotFound(_)) => (StatusCode::NOT_FOUND, "task_not_found"),
            (_, QueueError::WorkerNotFound(_)) => (StatusCode::NOT_FOUND, "worker_not_found"),
            // the worker has to register again before it can poll or heartbeat
            (ErrorKind::UnknownWorker, _) => (StatusCode::NOT_FOUND, "re-register"),
            (_, QueueError::AlreadyClaimed(_)) => (StatusCode::CONFLICT, "already_claimed"),
            (_, QueueError::NotLeaseHolder { .. }) => (StatusCode::CONFLICT, "not_lease_holder"),
            (_, QueueError::InvalidTransition { .. }) => (StatusCode::CONFLICT, "invalid_transition"),
            (ErrorKind::Contention, _) => (StatusCode::CONFLICT, "conflict"),
            (ErrorKind::Invalid, _) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            (ErrorKind::Infrastructure, _) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            (ErrorKind::NotFound, _) => (StatusCode::NOT_FOUND, "not_found"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            ApiError::Queue(err) => err.to_string(),
            ApiError::BadRequest(message) => message.clone(),
        };

        if status.is_server_error() {
            tracing::warn!(error = %message, "request failed");
        } else {
            tracing::debug!(code, error = %message, "request rejected");
        }

        let mut response = (status, Json(ErrorBody { error: code, message })).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bobbin_core::{TaskId, TaskStatus, WorkerId};

    fn status_of(err: QueueError) -> (StatusCode, &'static str) {
        ApiError::from(err).status_and_code()
    }

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let task: TaskId = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
        let worker = WorkerId::new("w").unwrap();

        assert_eq!(status_of(QueueError::TaskNotFound(task)).0, StatusCode::NOT_FOUND);
        assert_eq!(status_of(QueueError::AlreadyClaimed(task)).0, StatusCode::CONFLICT);
        assert_eq!(
            status_of(QueueError::InvalidTransition {
                task,
                from: TaskStatus::Completed,
                action: "claim",
            })
            .0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(QueueError::UnknownWorker(worker)),
            (StatusCode::NOT_FOUND, "re-register")
        );
        assert_eq!(
            status_of(QueueError::InvalidPayload("x".into())).0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn store_failures_ask_the_client_to_retry() {
        let response = ApiError::from(QueueError::StoreUnavailable("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], RETRY_AFTER_SECS);
    }
}
