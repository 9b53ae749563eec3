use axum::Router;

pub mod system;
pub mod tasks;

/// Router for all API endpoints except `/health`.
pub fn router() -> Router {
    Router::new().nest("/tasks", tasks::router())
}
