use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_worker::WorkerError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// HTTP status for a worker error, by category.
fn worker_status(err: &WorkerError) -> StatusCode {
    match err {
        WorkerError::BackupInProgress
        | WorkerError::RestoreInProgress
        | WorkerError::TaskConflict { .. } => StatusCode::CONFLICT,
        WorkerError::NotReady(_)
        | WorkerError::NoConnection(_)
        | WorkerError::ConsensusNotInitialized
        | WorkerError::NotServingGroup(_)
        | WorkerError::GroupMismatch { .. }
        | WorkerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        WorkerError::WaitForTs { .. } => StatusCode::GATEWAY_TIMEOUT,
        e if e.is_rejection() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg, code) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), "not_found"),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone(), "rejected"),
            AppError::Worker(e) => {
                let status = worker_status(e);
                if status.is_server_error() {
                    tracing::error!(code = e.code(), "Worker error: {e}");
                }
                (status, e.to_string(), e.code())
            }
        };
        (status, Json(json!({ "error": msg, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_status() {
        assert_eq!(worker_status(&WorkerError::BackupInProgress), StatusCode::CONFLICT);
        assert_eq!(
            worker_status(&WorkerError::EncryptionMismatch("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(worker_status(&WorkerError::NoConnection(2)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            worker_status(&WorkerError::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_remote_task_conflict_is_conflict() {
        let err = WorkerError::from_remote(
            "task_conflict",
            3,
            "Cannot start backup: operation restore is already running".to_string(),
        );
        assert_eq!(worker_status(&err), StatusCode::CONFLICT);
    }
}
