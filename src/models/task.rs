//! Represents an asynchronous merge task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a merge task. Transitions are strictly
/// `pending → running → {completed | failed}`; terminal states never
/// transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A persisted merge task row. Created only when the orchestrator
/// judges a synchronous merge too expensive.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MergeTask {
    /// Task identifier handed back to the caller for polling.
    pub task_id: String,

    /// Session being merged.
    pub upload_id: String,

    /// Current status (`pending`, `running`, `completed`, `failed`).
    pub status: String,

    /// Merge progress, 0–100.
    pub progress: i64,

    /// Destination path of the finished artifact (set on completion).
    pub file_path: Option<String>,

    /// Download URL of the finished artifact (set on completion).
    pub file_url: Option<String>,

    /// Size of the finished artifact in bytes (set on completion).
    pub file_size: Option<i64>,

    /// Artifact identifier (set on completion).
    pub file_id: Option<String>,

    /// Human-readable failure message (set on failure).
    pub error: Option<String>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
}

impl MergeTask {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status).unwrap_or(TaskStatus::Failed)
    }
}
