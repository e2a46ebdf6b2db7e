//! Persisted merge-task records.
//!
//! `create` / `get` / `update` over the `merge_tasks` table. Updates
//! refuse to touch rows already in a terminal state, which is what
//! keeps `pending → running → {completed | failed}` strict.

use chrono::Utc;
use sqlx::{QueryBuilder, sqlite::Sqlite};
use thiserror::Error;
use uuid::Uuid;

use super::RelayService;
use crate::models::task::{MergeTask, TaskStatus};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("merge task `{0}` not found")]
    NotFound(String),
    #[error("merge task `{0}` is already in a terminal state")]
    Terminal(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Partial update applied to a merge task. `None` fields are left
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<i64>,
    pub file_path: Option<String>,
    pub file_url: Option<String>,
    pub file_size: Option<i64>,
    pub file_id: Option<String>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: i64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

const TASK_COLUMNS: &str = "task_id, upload_id, status, progress, file_path, file_url, \
                            file_size, file_id, error, created_at, updated_at";

impl RelayService {
    /// Create a `pending` task for a session and return it.
    pub async fn create_task(&self, upload_id: &str) -> TaskResult<MergeTask> {
        let now = Utc::now();
        let task = MergeTask {
            task_id: Uuid::new_v4().to_string(),
            upload_id: upload_id.to_string(),
            status: TaskStatus::Pending.as_str().to_string(),
            progress: 0,
            file_path: None,
            file_url: None,
            file_size: None,
            file_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO merge_tasks
                 (task_id, upload_id, status, progress, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(&task.upload_id)
        .bind(&task.status)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.db)
        .await?;

        Ok(task)
    }

    /// Fetch a task by id.
    pub async fn get_task(&self, task_id: &str) -> TaskResult<MergeTask> {
        sqlx::query_as::<_, MergeTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM merge_tasks WHERE task_id = ?"
        ))
        .bind(task_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => TaskError::NotFound(task_id.to_string()),
            other => TaskError::Sqlx(other),
        })
    }

    /// Apply a partial update, refusing to modify terminal rows.
    pub async fn update_task(&self, task_id: &str, update: TaskUpdate) -> TaskResult<()> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE merge_tasks SET updated_at = ");
        builder.push_bind(Utc::now());

        if let Some(status) = update.status {
            builder.push(", status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(progress) = update.progress {
            builder.push(", progress = ");
            builder.push_bind(progress.clamp(0, 100));
        }
        if let Some(file_path) = update.file_path {
            builder.push(", file_path = ");
            builder.push_bind(file_path);
        }
        if let Some(file_url) = update.file_url {
            builder.push(", file_url = ");
            builder.push_bind(file_url);
        }
        if let Some(file_size) = update.file_size {
            builder.push(", file_size = ");
            builder.push_bind(file_size);
        }
        if let Some(file_id) = update.file_id {
            builder.push(", file_id = ");
            builder.push_bind(file_id);
        }
        if let Some(error) = update.error {
            builder.push(", error = ");
            builder.push_bind(error);
        }

        builder.push(" WHERE task_id = ");
        builder.push_bind(task_id);
        builder.push(" AND status NOT IN ('completed', 'failed')");

        let result = builder.build().execute(&*self.db).await?;
        if result.rows_affected() == 0 {
            // Either missing or already terminal; disambiguate for the caller.
            return match self.get_task(task_id).await {
                Ok(_) => Err(TaskError::Terminal(task_id.to_string())),
                Err(err) => Err(err),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let t = testing::service(u64::MAX, false).await;
        let task = t.service.create_task("up-t1").await.unwrap();

        let fetched = t.service.get_task(&task.task_id).await.unwrap();
        assert_eq!(fetched.upload_id, "up-t1");
        assert_eq!(fetched.status(), TaskStatus::Pending);
        assert_eq!(fetched.progress, 0);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let t = testing::service(u64::MAX, false).await;
        let err = t.service.get_task("nope").await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminal_tasks_refuse_further_updates() {
        let t = testing::service(u64::MAX, false).await;
        let task = t.service.create_task("up-t2").await.unwrap();

        t.service
            .update_task(&task.task_id, TaskUpdate::status(TaskStatus::Running))
            .await
            .unwrap();
        t.service
            .update_task(&task.task_id, TaskUpdate::failed("boom"))
            .await
            .unwrap();

        let err = t
            .service
            .update_task(&task.task_id, TaskUpdate::progress(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Terminal(_)));

        let task = t.service.get_task(&task.task_id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let t = testing::service(u64::MAX, false).await;
        let task = t.service.create_task("up-t3").await.unwrap();
        t.service
            .update_task(&task.task_id, TaskUpdate::progress(250))
            .await
            .unwrap();
        let task = t.service.get_task(&task.task_id).await.unwrap();
        assert_eq!(task.progress, 100);
    }
}
