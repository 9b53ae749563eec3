use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use taskwatch_core::TaskId;
use taskwatch_infra::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("task {id} not found"))
        }
        ServiceError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        ServiceError::Store(e) => {
            tracing::error!(error = %e, "task store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "task storage unavailable")
        }
        ServiceError::Dispatch(e) => {
            tracing::warn!(error = %e, "task dispatch failed");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "dispatch_error",
                "task could not be queued; please try again",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_task_id(raw: &str) -> Result<TaskId, axum::response::Response> {
    raw.parse()
        .map_err(|e: taskwatch_core::DomainError| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
