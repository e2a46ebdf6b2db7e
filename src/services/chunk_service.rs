//! Chunk receiver.
//!
//! Persists one chunk per call, keyed deterministically by
//! `(uploadId, index)` so retried uploads overwrite rather than
//! duplicate. The receiver does **not** track cross-call completeness;
//! that is the merge orchestrator's job at completion time.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use super::RelayService;
use super::store::{ObjectStore, StoreError, ensure_key_safe};
use crate::models::{
    session::{SessionState, UploadSession},
    wire::{ChunkEnvelope, ChunkReceipt},
};

const MAX_UPLOAD_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk index {index} out of range for {total} chunks")]
    InvalidIndex { index: u32, total: u32 },
    #[error("invalid upload id `{0}`")]
    InvalidUploadId(String),
    #[error("invalid chunk payload: {0}")]
    InvalidPayload(String),
    #[error("invalid destination path")]
    InvalidDestPath,
    #[error(
        "envelope disagrees with session `{upload_id}`: expected {expected}, got {got}"
    )]
    SessionMismatch {
        upload_id: String,
        expected: String,
        got: String,
    },
    #[error("session `{upload_id}` is no longer accepting chunks (state `{state}`)")]
    SessionClosed { upload_id: String, state: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type ChunkResult<T> = Result<T, ChunkError>;

/// Deterministic storage key for a chunk. Determinism is what makes
/// retried chunk uploads idempotent: same key, overwrite.
pub fn chunk_key(upload_id: &str, index: u32) -> String {
    format!("chunks/{}/{:05}.part", upload_id, index)
}

fn ensure_upload_id_safe(upload_id: &str) -> ChunkResult<()> {
    if upload_id.is_empty()
        || upload_id.len() > MAX_UPLOAD_ID_LEN
        || !upload_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ChunkError::InvalidUploadId(upload_id.to_string()));
    }
    Ok(())
}

impl RelayService {
    /// Validate and persist one chunk envelope, returning its storage
    /// handle. Implicitly creates the session on the first chunk call;
    /// rejects envelopes inconsistent with the session's previously
    /// observed shape rather than silently accepting a corrupting write.
    pub async fn receive_chunk(&self, envelope: ChunkEnvelope) -> ChunkResult<ChunkReceipt> {
        ensure_upload_id_safe(&envelope.upload_id)?;
        ensure_key_safe(&envelope.dest_path).map_err(|_| ChunkError::InvalidDestPath)?;

        if envelope.total_chunks == 0 || envelope.index >= envelope.total_chunks {
            return Err(ChunkError::InvalidIndex {
                index: envelope.index,
                total: envelope.total_chunks,
            });
        }

        let bytes = general_purpose::STANDARD
            .decode(&envelope.data)
            .map_err(|err| ChunkError::InvalidPayload(err.to_string()))?;
        let bytes = Bytes::from(bytes);

        let session = self.observe_session(&envelope, bytes.len() as i64).await?;
        match session.state() {
            SessionState::Open => {}
            other => {
                return Err(ChunkError::SessionClosed {
                    upload_id: envelope.upload_id.clone(),
                    state: other.as_str().to_string(),
                });
            }
        }

        let handle = chunk_key(&envelope.upload_id, envelope.index);
        let size = self.store.put(&handle, bytes).await?;

        sqlx::query(
            "INSERT INTO chunks (upload_id, idx, storage_handle, size_bytes, received_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(upload_id, idx) DO UPDATE SET
                 storage_handle = excluded.storage_handle,
                 size_bytes = excluded.size_bytes,
                 received_at = excluded.received_at",
        )
        .bind(&envelope.upload_id)
        .bind(envelope.index as i64)
        .bind(&handle)
        .bind(size as i64)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        debug!(
            upload_id = %envelope.upload_id,
            index = envelope.index,
            size,
            "chunk persisted"
        );

        Ok(ChunkReceipt {
            file_id: handle,
            chunk_index: envelope.index,
            received: true,
        })
    }

    /// Upsert the session implied by a chunk envelope and return it,
    /// enforcing that `total_chunks` and `dest_path` never drift across
    /// calls sharing an `uploadId`. The first chunk to arrive records
    /// its decoded size as the session's `chunk_size`.
    async fn observe_session(
        &self,
        envelope: &ChunkEnvelope,
        chunk_size: i64,
    ) -> ChunkResult<UploadSession> {
        sqlx::query(
            "INSERT INTO upload_sessions
                 (upload_id, dest_path, total_chunks, chunk_size, state, created_at)
             VALUES (?, ?, ?, ?, 'open', ?)
             ON CONFLICT(upload_id) DO NOTHING",
        )
        .bind(&envelope.upload_id)
        .bind(&envelope.dest_path)
        .bind(envelope.total_chunks as i64)
        .bind(chunk_size)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT upload_id, dest_path, total_chunks, chunk_size, state, created_at
             FROM upload_sessions WHERE upload_id = ?",
        )
        .bind(&envelope.upload_id)
        .fetch_one(&*self.db)
        .await?;

        if session.total_chunks != envelope.total_chunks as i64 {
            return Err(ChunkError::SessionMismatch {
                upload_id: envelope.upload_id.clone(),
                expected: format!("totalChunks {}", session.total_chunks),
                got: format!("totalChunks {}", envelope.total_chunks),
            });
        }
        if session.dest_path != envelope.dest_path {
            return Err(ChunkError::SessionMismatch {
                upload_id: envelope.upload_id.clone(),
                expected: format!("destPath `{}`", session.dest_path),
                got: format!("destPath `{}`", envelope.dest_path),
            });
        }

        Ok(session)
    }
}
