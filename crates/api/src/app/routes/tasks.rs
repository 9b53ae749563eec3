use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_task))
        .route("/stats", get(task_stats))
        .route("/:id", get(get_task).delete(cancel_task))
}

pub async fn submit_task(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitTaskRequest>,
) -> axum::response::Response {
    match services.tasks.submit(&body.task_type, body.payload).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(dto::SubmitTaskResponse { task_id }),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Status poll. Reconciles the task first, so a dead task shows up as
/// failed on the very next poll.
pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let task_id = match errors::parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.tasks.get_status(task_id).await {
        Ok(Some(record)) => Json(dto::TaskView::from(record)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("task {task_id} not found")),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn cancel_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let task_id = match errors::parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.tasks.cancel(task_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn task_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.tasks.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
