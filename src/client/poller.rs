//! Merge task poller.
//!
//! Polls task status on a fixed interval until the task reaches a
//! terminal state. A `failed` task surfaces the server's error message
//! verbatim; the poller never re-triggers a merge — recovery means
//! re-uploading the whole session under a new uploadId.

use std::time::Duration;
use tracing::debug;

use super::{ClientError, ClientResult, RelayClient};
use crate::models::{artifact::MergedArtifact, task::TaskStatus};

/// Polling knobs.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Delay between status calls.
    pub interval: Duration,
    /// Give up after this many polls with a distinct timeout error.
    /// `None` polls until the server reports a terminal state.
    pub max_attempts: Option<u32>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: None,
        }
    }
}

/// Poll `task_id` until it completes or fails.
pub async fn wait_for_merge(
    client: &RelayClient,
    task_id: &str,
    opts: &PollOptions,
) -> ClientResult<MergedArtifact> {
    let mut attempts: u32 = 0;

    loop {
        let status = client.task_status(task_id).await?;
        debug!(task_id, status = ?status.status, progress = status.progress, "merge task polled");

        match status.status {
            TaskStatus::Completed => {
                let file_path = status.file_path.ok_or_else(|| {
                    ClientError::MalformedResponse("completed task missing filePath".into())
                })?;
                let file_url = status.file_url.ok_or_else(|| {
                    ClientError::MalformedResponse("completed task missing fileUrl".into())
                })?;
                let file_size = status.file_size.ok_or_else(|| {
                    ClientError::MalformedResponse("completed task missing fileSize".into())
                })?;
                return Ok(MergedArtifact {
                    file_path,
                    file_url,
                    file_size,
                    file_id: status.file_id.unwrap_or_else(|| task_id.to_string()),
                });
            }
            TaskStatus::Failed => {
                return Err(ClientError::MergeFailed(
                    status.error.unwrap_or_default(),
                ));
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        attempts += 1;
        if let Some(max) = opts.max_attempts {
            if attempts >= max {
                return Err(ClientError::MergeTimedOut { attempts });
            }
        }
        tokio::time::sleep(opts.interval).await;
    }
}
