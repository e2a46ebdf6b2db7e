//! Merge orchestration.
//!
//! The completion call is the first point that can verify session
//! completeness — the receiver never tracks it across calls — so the
//! orchestrator enumerates every expected index before a single byte is
//! appended. Claiming a session for merge is a conditional write
//! (`open → merging`), so a second concurrent completion call is
//! rejected instead of double-writing the artifact.
//!
//! Merges always append in strict ascending index order regardless of
//! the order chunks arrived. Cheap merges run inline in the completion
//! response; expensive ones run on a background task that updates a
//! persisted `MergeTask` and honors cooperative cancellation.

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RelayService;
use super::store::{ObjectStore, StoreError, ensure_key_safe};
use super::task_store::{TaskError, TaskUpdate};
use crate::models::{
    artifact::MergedArtifact,
    chunk::ChunkRecord,
    session::{SessionState, UploadSession},
    task::TaskStatus,
    wire::{CompleteData, CompleteRequest, DeferredChunks, TaskHandle},
};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("unknown upload session `{0}`")]
    UnknownSession(String),
    #[error(
        "completion call disagrees with session `{upload_id}`: expected {expected}, got {got}"
    )]
    SessionMismatch {
        upload_id: String,
        expected: String,
        got: String,
    },
    #[error("session `{0}` is already merging")]
    AlreadyMerging(String),
    #[error("session `{upload_id}` already finished (state `{state}`)")]
    SessionClosed { upload_id: String, state: String },
    #[error("missing chunk index {index} of {total}; re-upload the session")]
    MissingChunk { index: i64, total: i64 },
    #[error("merge cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type MergeResult<T> = Result<T, MergeError>;

/// Final artifact key: the session's destination path, with the optional
/// completion-call file name appended beneath it.
fn artifact_key(dest_path: &str, file_name: Option<&str>) -> String {
    match file_name {
        Some(name) => format!("{}/{}", dest_path.trim_end_matches('/'), name),
        None => dest_path.to_string(),
    }
}

impl RelayService {
    /// Handle a completion call for a session whose sender believes all
    /// chunks are uploaded. Returns one of three shapes: a finished
    /// artifact (synchronous merge), a task handle (background merge),
    /// or the chunk URL list (merge deferred to the caller).
    pub async fn complete_upload(&self, req: CompleteRequest) -> MergeResult<CompleteData> {
        let session = self.fetch_session(&req.upload_id).await?;

        if session.total_chunks != req.total_chunks as i64 {
            return Err(MergeError::SessionMismatch {
                upload_id: req.upload_id.clone(),
                expected: format!("totalChunks {}", session.total_chunks),
                got: format!("totalChunks {}", req.total_chunks),
            });
        }
        if session.dest_path != req.dest_path {
            return Err(MergeError::SessionMismatch {
                upload_id: req.upload_id.clone(),
                expected: format!("destPath `{}`", session.dest_path),
                got: format!("destPath `{}`", req.dest_path),
            });
        }

        let dest = artifact_key(&session.dest_path, req.file_name.as_deref());
        ensure_key_safe(&dest)?;

        // Deferred mode never claims the session: the completion call is
        // read-only, so a re-issued call returns the same URL list.
        if self.defer_merge {
            let rows = self.collect_chunks(&session).await?;
            let chunk_urls = rows
                .iter()
                .map(|row| self.store.download_url(&row.storage_handle))
                .collect();
            return Ok(CompleteData::Deferred(DeferredChunks { chunk_urls }));
        }

        self.claim_session(&session.upload_id).await?;

        // Fail fast on any gap before appending; release the session so
        // idempotent re-upload under the same uploadId stays possible.
        let rows = match self.collect_chunks(&session).await {
            Ok(rows) => rows,
            Err(err) => {
                self.set_session_state(&session.upload_id, SessionState::Open)
                    .await?;
                return Err(err);
            }
        };

        let combined_size: i64 = rows.iter().map(|r| r.size_bytes).sum();
        let handles_supplied = req
            .chunk_handles
            .as_ref()
            .is_some_and(|handles| !handles.is_empty());

        if handles_supplied && (combined_size as u64) < self.sync_merge_threshold {
            debug!(
                upload_id = %session.upload_id,
                combined_size,
                "merging synchronously"
            );
            match self.merge_chunks(&session, &dest, &rows, None, None).await {
                Ok(artifact) => {
                    self.set_session_state(&session.upload_id, SessionState::Done)
                        .await?;
                    Ok(CompleteData::Merged(artifact))
                }
                Err(err) => {
                    self.set_session_state(&session.upload_id, SessionState::Failed)
                        .await?;
                    Err(err)
                }
            }
        } else {
            let task = self.create_task(&session.upload_id).await?;
            let token = self.register_cancellation(&task.task_id);
            let service = self.clone();
            let task_id = task.task_id.clone();
            let session_clone = session.clone();
            // The background merge must never block this response.
            tokio::spawn(async move {
                service
                    .run_background_merge(task_id, session_clone, dest, rows, token)
                    .await;
            });

            Ok(CompleteData::Task(TaskHandle {
                status_url: format!("/v1/tasks/status?taskId={}", task.task_id),
                task_id: task.task_id,
                progress: 0,
            }))
        }
    }

    async fn fetch_session(&self, upload_id: &str) -> MergeResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT upload_id, dest_path, total_chunks, chunk_size, state, created_at
             FROM upload_sessions WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => MergeError::UnknownSession(upload_id.to_string()),
            other => MergeError::Sqlx(other),
        })
    }

    /// Conditional write claiming the session for merge. Exactly one
    /// concurrent completion call can win.
    async fn claim_session(&self, upload_id: &str) -> MergeResult<()> {
        let result =
            sqlx::query("UPDATE upload_sessions SET state = 'merging' WHERE upload_id = ? AND state = 'open'")
                .bind(upload_id)
                .execute(&*self.db)
                .await?;

        if result.rows_affected() == 0 {
            let session = self.fetch_session(upload_id).await?;
            return match session.state() {
                SessionState::Merging => Err(MergeError::AlreadyMerging(upload_id.to_string())),
                state => Err(MergeError::SessionClosed {
                    upload_id: upload_id.to_string(),
                    state: state.as_str().to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn set_session_state(
        &self,
        upload_id: &str,
        state: SessionState,
    ) -> MergeResult<()> {
        sqlx::query("UPDATE upload_sessions SET state = ? WHERE upload_id = ?")
            .bind(state.as_str())
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Load every chunk row in ascending index order and fail naming the
    /// first gap if any expected index is absent.
    async fn collect_chunks(&self, session: &UploadSession) -> MergeResult<Vec<ChunkRecord>> {
        let rows = sqlx::query_as::<_, ChunkRecord>(
            "SELECT upload_id, idx, storage_handle, size_bytes, received_at
             FROM chunks WHERE upload_id = ? ORDER BY idx ASC",
        )
        .bind(&session.upload_id)
        .fetch_all(&*self.db)
        .await?;

        for expected in 0..session.total_chunks {
            match rows.get(expected as usize) {
                Some(row) if row.idx == expected => {}
                _ => {
                    return Err(MergeError::MissingChunk {
                        index: expected,
                        total: session.total_chunks,
                    });
                }
            }
        }

        Ok(rows)
    }

    /// Ordered concatenation of all chunks into `dest`.
    ///
    /// Appends to a temp object and commits with a rename, so no partial
    /// artifact is ever published. When `task_id` is set, task progress
    /// is bumped after each appended chunk; when `cancel` is set, the
    /// token is checked between appends and cancellation aborts with the
    /// partial temp object removed. Temp chunks are deleted only after a
    /// successful commit.
    pub(crate) async fn merge_chunks(
        &self,
        session: &UploadSession,
        dest: &str,
        rows: &[ChunkRecord],
        task_id: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> MergeResult<MergedArtifact> {
        let tmp = format!("{}.tmp-{}", dest, Uuid::new_v4().simple());
        let total = rows.len() as i64;
        let mut digest = md5::Context::new();
        let mut file_size: i64 = 0;

        for (pos, row) in rows.iter().enumerate() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                let _ = self.store.remove(&tmp).await;
                return Err(MergeError::Cancelled);
            }

            let bytes: Bytes = match self.store.read(&row.storage_handle).await {
                Ok(bytes) => bytes,
                Err(StoreError::NotFound(_)) => {
                    let _ = self.store.remove(&tmp).await;
                    return Err(MergeError::MissingChunk {
                        index: row.idx,
                        total,
                    });
                }
                Err(err) => {
                    let _ = self.store.remove(&tmp).await;
                    return Err(err.into());
                }
            };

            digest.consume(&bytes);
            file_size += bytes.len() as i64;
            if let Err(err) = self.store.append(&tmp, bytes).await {
                let _ = self.store.remove(&tmp).await;
                return Err(err.into());
            }

            if let Some(task_id) = task_id {
                let progress = ((pos as i64 + 1) * 100) / total.max(1);
                if let Err(err) = self.update_task(task_id, TaskUpdate::progress(progress)).await
                {
                    warn!(task_id, %err, "failed to record merge progress");
                }
            }
        }

        if let Err(err) = self.store.commit(&tmp, dest).await {
            let _ = self.store.remove(&tmp).await;
            return Err(err.into());
        }

        // Temp chunks are consumed; delete payloads and rows.
        for row in rows {
            if let Err(err) = self.store.remove(&row.storage_handle).await {
                warn!(handle = %row.storage_handle, %err, "failed to delete temp chunk");
            }
        }
        sqlx::query("DELETE FROM chunks WHERE upload_id = ?")
            .bind(&session.upload_id)
            .execute(&*self.db)
            .await?;

        let etag = format!("{:x}", digest.compute());
        info!(
            upload_id = %session.upload_id,
            dest,
            file_size,
            etag,
            "merge complete"
        );

        Ok(MergedArtifact {
            file_path: dest.to_string(),
            file_url: self.store.download_url(dest),
            file_size,
            file_id: Uuid::new_v4().to_string(),
        })
    }

    /// Background half of an asynchronous merge: identical ordered
    /// append, with task bookkeeping around it.
    async fn run_background_merge(
        self,
        task_id: String,
        session: UploadSession,
        dest: String,
        rows: Vec<ChunkRecord>,
        token: CancellationToken,
    ) {
        if let Err(err) = self
            .update_task(&task_id, TaskUpdate::status(TaskStatus::Running))
            .await
        {
            warn!(task_id, %err, "failed to mark merge task running");
        }

        let result = self
            .merge_chunks(&session, &dest, &rows, Some(&task_id), Some(&token))
            .await;

        let (task_update, session_state) = match result {
            Ok(artifact) => (
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    progress: Some(100),
                    file_path: Some(artifact.file_path),
                    file_url: Some(artifact.file_url),
                    file_size: Some(artifact.file_size),
                    file_id: Some(artifact.file_id),
                    error: None,
                },
                SessionState::Done,
            ),
            Err(MergeError::Cancelled) => {
                (TaskUpdate::failed("cancelled"), SessionState::Failed)
            }
            Err(err) => (TaskUpdate::failed(err.to_string()), SessionState::Failed),
        };

        if let Err(err) = self.update_task(&task_id, task_update).await {
            warn!(task_id, %err, "failed to finalize merge task");
        }
        if let Err(err) = self
            .set_session_state(&session.upload_id, session_state)
            .await
        {
            warn!(upload_id = %session.upload_id, %err, "failed to finalize session state");
        }
        self.deregister_cancellation(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::wire::ChunkEnvelope;
    use crate::services::testing;
    use base64::{Engine as _, engine::general_purpose};
    use std::time::Duration;

    async fn send_chunk(
        service: &RelayService,
        upload_id: &str,
        index: u32,
        total: u32,
        payload: &[u8],
    ) -> String {
        service
            .receive_chunk(ChunkEnvelope {
                upload_id: upload_id.into(),
                index,
                total_chunks: total,
                dest_path: "out".into(),
                data: general_purpose::STANDARD.encode(payload),
            })
            .await
            .unwrap()
            .file_id
    }

    fn complete_req(upload_id: &str, total: u32, handles: Option<Vec<String>>) -> CompleteRequest {
        CompleteRequest {
            upload_id: upload_id.into(),
            total_chunks: total,
            dest_path: "out".into(),
            file_name: Some("artifact.bin".into()),
            chunk_handles: handles,
        }
    }

    async fn wait_for_terminal(service: &RelayService, task_id: &str) -> crate::models::task::MergeTask {
        for _ in 0..200 {
            let task = service.get_task(task_id).await.unwrap();
            if task.status().is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("merge task `{task_id}` never reached a terminal state");
    }

    #[tokio::test]
    async fn small_merge_with_handles_runs_synchronously() {
        let t = testing::service(u64::MAX, false).await;
        let mut handles = Vec::new();
        for (i, part) in [b"aaa".as_slice(), b"bb", b"c"].iter().enumerate() {
            handles.push(send_chunk(&t.service, "up-m1", i as u32, 3, part).await);
        }

        let data = t
            .service
            .complete_upload(complete_req("up-m1", 3, Some(handles)))
            .await
            .unwrap();

        let CompleteData::Merged(artifact) = data else {
            panic!("expected synchronous merge");
        };
        assert_eq!(artifact.file_path, "out/artifact.bin");
        assert_eq!(artifact.file_size, 6);
        assert_eq!(
            t.service.store.read("out/artifact.bin").await.unwrap(),
            Bytes::from_static(b"aaabbc")
        );

        // temp chunks consumed
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE upload_id = ?")
            .bind("up-m1")
            .fetch_one(&*t.service.db)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn large_merge_goes_async_and_completes() {
        // threshold 0 forces every merge onto the background path
        let t = testing::service(0, false).await;
        let mut handles = Vec::new();
        for i in 0..3u32 {
            handles.push(send_chunk(&t.service, "up-m2", i, 3, &[i as u8; 64]).await);
        }

        let data = t
            .service
            .complete_upload(complete_req("up-m2", 3, Some(handles)))
            .await
            .unwrap();
        let CompleteData::Task(handle) = data else {
            panic!("expected async merge task");
        };
        assert!(handle.status_url.contains(&handle.task_id));

        let task = wait_for_terminal(&t.service, &handle.task_id).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.file_size, Some(192));
        assert!(task.file_url.is_some());
        assert!(task.file_id.is_some());
    }

    #[tokio::test]
    async fn combined_size_at_the_threshold_goes_async() {
        // 3 + 3 bytes against a 6-byte threshold: not strictly under,
        // so the merge must not run inline.
        let t = testing::service(6, false).await;
        let mut handles = Vec::new();
        for (i, part) in [b"aaa".as_slice(), b"bbb"].iter().enumerate() {
            handles.push(send_chunk(&t.service, "up-m8", i as u32, 2, part).await);
        }

        let data = t
            .service
            .complete_upload(complete_req("up-m8", 2, Some(handles)))
            .await
            .unwrap();
        let CompleteData::Task(handle) = data else {
            panic!("expected an async merge at the threshold boundary");
        };

        let task = wait_for_terminal(&t.service, &handle.task_id).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.file_size, Some(6));
    }

    #[tokio::test]
    async fn missing_index_fails_fast_and_releases_session() {
        let t = testing::service(u64::MAX, false).await;
        send_chunk(&t.service, "up-m3", 0, 3, b"a").await;
        send_chunk(&t.service, "up-m3", 2, 3, b"c").await;

        let err = t
            .service
            .complete_upload(complete_req("up-m3", 3, None))
            .await
            .unwrap_err();
        match err {
            MergeError::MissingChunk { index, total } => {
                assert_eq!(index, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected MissingChunk, got {other}"),
        }
        assert!(err.to_string().contains("index 1"));

        // idempotent re-upload under the same uploadId then re-complete
        let handles = vec![
            send_chunk(&t.service, "up-m3", 1, 3, b"b").await,
        ];
        let data = t
            .service
            .complete_upload(complete_req("up-m3", 3, Some(handles)))
            .await
            .unwrap();
        let CompleteData::Merged(artifact) = data else {
            panic!("expected synchronous merge after repair");
        };
        assert_eq!(artifact.file_size, 3);
        assert_eq!(
            t.service.store.read("out/artifact.bin").await.unwrap(),
            Bytes::from_static(b"abc")
        );
    }

    #[tokio::test]
    async fn second_completion_call_is_rejected() {
        let t = testing::service(u64::MAX, false).await;
        let handles = vec![send_chunk(&t.service, "up-m4", 0, 1, b"only").await];

        let first = t
            .service
            .complete_upload(complete_req("up-m4", 1, Some(handles)))
            .await
            .unwrap();
        assert!(matches!(first, CompleteData::Merged(_)));

        let err = t
            .service
            .complete_upload(complete_req("up-m4", 1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let t = testing::service(u64::MAX, false).await;
        let err = t
            .service
            .complete_upload(complete_req("up-nope", 1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn total_chunks_mismatch_is_rejected() {
        let t = testing::service(u64::MAX, false).await;
        send_chunk(&t.service, "up-m5", 0, 2, b"a").await;
        let err = t
            .service
            .complete_upload(complete_req("up-m5", 3, None))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::SessionMismatch { .. }));
    }

    #[tokio::test]
    async fn deferred_mode_returns_chunk_urls_in_index_order() {
        let t = testing::service(u64::MAX, true).await;
        // upload out of order on purpose
        send_chunk(&t.service, "up-m6", 2, 3, b"c").await;
        send_chunk(&t.service, "up-m6", 0, 3, b"a").await;
        send_chunk(&t.service, "up-m6", 1, 3, b"b").await;

        let data = t
            .service
            .complete_upload(complete_req("up-m6", 3, None))
            .await
            .unwrap();
        let CompleteData::Deferred(deferred) = data else {
            panic!("expected deferred chunk URLs");
        };
        assert_eq!(deferred.chunk_urls.len(), 3);
        for (i, url) in deferred.chunk_urls.iter().enumerate() {
            assert!(url.ends_with(&format!("{:05}.part", i)), "url {url} not in index order");
        }

        // read-only: a second completion call returns the same list
        let again = t
            .service
            .complete_upload(complete_req("up-m6", 3, None))
            .await
            .unwrap();
        assert!(matches!(again, CompleteData::Deferred(_)));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_merge_and_removes_partial_output() {
        let t = testing::service(u64::MAX, false).await;
        send_chunk(&t.service, "up-m7", 0, 2, b"aa").await;
        send_chunk(&t.service, "up-m7", 1, 2, b"bb").await;

        let session = t.service.fetch_session("up-m7").await.unwrap();
        let rows = t.service.collect_chunks(&session).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = t
            .service
            .merge_chunks(&session, "out/cancelled.bin", &rows, None, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Cancelled));
        assert!(matches!(
            t.service.store.read("out/cancelled.bin").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
