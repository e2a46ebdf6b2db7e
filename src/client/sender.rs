//! Chunk sender.
//!
//! Splits a source file into fixed-size pieces, uploads them with
//! bounded concurrency and per-chunk retry, then issues the completion
//! call. Chunks are self-describing by index, so server-observed order
//! does not matter; the handle list is re-sorted by index before the
//! completion call so handle-based merge stays cheap on the server.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use std::{path::Path, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClientError, ClientResult, RelayClient};
use crate::models::{
    artifact::MergedArtifact,
    wire::{ChunkEnvelope, CompleteRequest, TaskHandle},
};

/// Recommended chunk size: large enough to be efficient, small enough
/// that base64 inflation (~4/3) plus the JSON framing stays under the
/// transport's binary-payload ceiling.
pub const RECOMMENDED_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Tuning knobs for an upload.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Bytes per chunk (final chunk may be smaller).
    pub chunk_size: usize,
    /// Chunk calls in flight at once.
    pub concurrency: usize,
    /// Attempt budget per chunk; exhausting it aborts the session.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            concurrency: 4,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

/// What the completion call produced.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// The server merged synchronously; the artifact is ready.
    Merged(MergedArtifact),
    /// The server merges in the background; poll the task.
    Pending(TaskHandle),
    /// The server deferred merging; download and concatenate locally.
    Deferred(Vec<String>),
}

/// Mint a session id: millisecond timestamp plus a random suffix.
/// Opaque to the server beyond path-safety; unique across senders.
pub fn mint_upload_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

/// Number of chunks a payload of `len` bytes splits into.
pub(crate) fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    len.div_ceil(chunk_size).max(1) as u32
}

impl RelayClient {
    /// Upload a file from disk. See [`RelayClient::upload_bytes`].
    pub async fn upload_file(
        &self,
        src: &Path,
        dest_path: &str,
        file_name: Option<&str>,
        opts: &SendOptions,
    ) -> ClientResult<UploadOutcome> {
        let data = tokio::fs::read(src).await?;
        self.upload_bytes(Bytes::from(data), dest_path, file_name, opts)
            .await
    }

    /// Upload a payload as one session: mint an uploadId, send every
    /// chunk, then complete. A single chunk exhausting its retry budget
    /// aborts the whole session — there is no partial commit; the
    /// orphaned chunks are left to the server's external sweep.
    pub async fn upload_bytes(
        &self,
        data: Bytes,
        dest_path: &str,
        file_name: Option<&str>,
        opts: &SendOptions,
    ) -> ClientResult<UploadOutcome> {
        if opts.chunk_size == 0 {
            return Err(ClientError::InvalidChunkSize);
        }

        let upload_id = mint_upload_id();
        let total = chunk_count(data.len(), opts.chunk_size);
        debug!(%upload_id, total, len = data.len(), "starting chunked upload");

        let mut results: Vec<(u32, String)> = stream::iter((0..total).map(|index| {
            let start = index as usize * opts.chunk_size;
            let end = data.len().min(start + opts.chunk_size);
            let envelope = ChunkEnvelope {
                upload_id: upload_id.clone(),
                index,
                total_chunks: total,
                dest_path: dest_path.to_string(),
                data: general_purpose::STANDARD.encode(data.slice(start..end)),
            };
            self.send_chunk_with_retry(envelope, opts)
        }))
        .buffer_unordered(opts.concurrency.max(1))
        .try_collect()
        .await?;

        // Handles go to the server in index order, whatever order the
        // uploads finished in.
        results.sort_by_key(|(index, _)| *index);
        let handles = results.into_iter().map(|(_, handle)| handle).collect();

        let outcome = self
            .complete(&CompleteRequest {
                upload_id,
                total_chunks: total,
                dest_path: dest_path.to_string(),
                file_name: file_name.map(str::to_string),
                chunk_handles: Some(handles),
            })
            .await?;

        Ok(match outcome {
            crate::models::wire::CompleteData::Merged(artifact) => {
                UploadOutcome::Merged(artifact)
            }
            crate::models::wire::CompleteData::Task(handle) => UploadOutcome::Pending(handle),
            crate::models::wire::CompleteData::Deferred(deferred) => {
                UploadOutcome::Deferred(deferred.chunk_urls)
            }
        })
    }

    async fn send_chunk_with_retry(
        &self,
        envelope: ChunkEnvelope,
        opts: &SendOptions,
    ) -> ClientResult<(u32, String)> {
        let index = envelope.index;
        let mut delay = opts.retry_base_delay;
        let mut last_err = String::new();

        for attempt in 1..=opts.max_attempts.max(1) {
            match self.post_chunk(&envelope).await {
                Ok(receipt) => return Ok((index, receipt.file_id)),
                Err(err) => {
                    last_err = err.to_string();
                    warn!(
                        index,
                        attempt,
                        max_attempts = opts.max_attempts,
                        %err,
                        "chunk call failed"
                    );
                }
            }
            if attempt < opts.max_attempts.max(1) {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(ClientError::ChunkRetriesExhausted {
            index,
            attempts: opts.max_attempts.max(1),
            last: last_err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_covers_the_tail() {
        let two_mib = 2 * 1024 * 1024;
        assert_eq!(chunk_count(5 * 1024 * 1024, two_mib), 3);
        assert_eq!(chunk_count(4 * 1024 * 1024, two_mib), 2);
        assert_eq!(chunk_count(1, two_mib), 1);
        assert_eq!(chunk_count(0, two_mib), 1);
        assert_eq!(chunk_count(two_mib + 1, two_mib), 2);
    }

    #[test]
    fn upload_ids_are_unique_and_path_safe() {
        let a = mint_upload_id();
        let b = mint_upload_id();
        assert_ne!(a, b);
        for id in [a, b] {
            assert!(
                id.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
                "unsafe upload id `{id}`"
            );
        }
    }
}
