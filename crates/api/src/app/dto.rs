use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskwatch_core::{TaskId, TaskRecord, TaskStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

/// What end users may see of a task. Technical detail stays server-side.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub log_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<TaskRecord> for TaskView {
    fn from(r: TaskRecord) -> Self {
        Self {
            task_id: r.task_id,
            task_type: r.task_type,
            status: r.status,
            created_at: r.created_at,
            completed_at: r.completed_at,
            log_messages: r.log_messages,
            error_message: r.error_message,
            result: r.result,
        }
    }
}
