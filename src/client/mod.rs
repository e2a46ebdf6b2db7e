//! Client side of the transfer pipeline: the chunk sender, the merge
//! task poller, and the fallback merger used when the server hands back
//! raw chunk URLs instead of merging itself.

pub mod fallback;
pub mod poller;
pub mod sender;

use bytes::Bytes;
use thiserror::Error;

use crate::models::wire::{
    ApiEnvelope, CHUNK_ENVELOPE_HEADER, CHUNK_ENVELOPE_JSON, ChunkEnvelope, ChunkReceipt,
    CompleteData, CompleteRequest, TaskStatusData,
};

pub use fallback::FallbackOptions;
pub use poller::PollOptions;
pub use sender::{SendOptions, UploadOutcome};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("server rejected call (code {code}): {message}")]
    Api { code: i64, message: String },
    #[error("malformed server response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("chunk size must be non-zero")]
    InvalidChunkSize,
    #[error("chunk {index} failed after {attempts} attempts: {last}; aborting session")]
    ChunkRetriesExhausted {
        index: u32,
        attempts: u32,
        last: String,
    },
    #[error("merge failed: {0}")]
    MergeFailed(String),
    #[error("merge timed out after {attempts} poll attempts")]
    MergeTimedOut { attempts: u32 },
    #[error("merged size mismatch: expected {expected} bytes, wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// HTTP client for the transfer protocol. One instance per relay
/// endpoint; cheap to clone via the inner reqwest client.
#[derive(Clone, Debug)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ClientResult<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send one chunk envelope. The body is JSON but goes out under a
    /// binary content-type with the marker header — the transport's
    /// text-body ceiling is far below a base64-inflated chunk.
    pub(crate) async fn post_chunk(&self, envelope: &ChunkEnvelope) -> ClientResult<ChunkReceipt> {
        let body = serde_json::to_vec(envelope)?;
        let resp = self
            .http
            .post(self.url("/v1/chunks"))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(CHUNK_ENVELOPE_HEADER, CHUNK_ENVELOPE_JSON)
            .body(body)
            .send()
            .await?;
        parse_envelope(resp).await
    }

    /// Issue the completion call for a session.
    pub async fn complete(&self, req: &CompleteRequest) -> ClientResult<CompleteData> {
        let resp = self
            .http
            .post(self.url("/v1/chunks/complete"))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;
        parse_envelope(resp).await
    }

    /// Fetch the current status of a merge task.
    pub async fn task_status(&self, task_id: &str) -> ClientResult<TaskStatusData> {
        let resp = self
            .http
            .get(self.url("/v1/tasks/status"))
            .query(&[("taskId", task_id)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        parse_envelope(resp).await
    }

    /// Download an object by URL. Relative URLs (as minted by the
    /// server) are resolved against the client's base.
    pub async fn download(&self, url: &str) -> ClientResult<Bytes> {
        let full = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            self.url(url)
        };
        let resp = self
            .http
            .get(full)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                code: status.as_u16() as i64,
                message,
            });
        }
        Ok(resp.bytes().await?)
    }
}

/// Decode a `{code, data, message}` envelope, surfacing non-zero codes
/// verbatim.
async fn parse_envelope<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> ClientResult<T> {
    let envelope: ApiEnvelope<T> = resp.json().await?;
    if envelope.code != 0 {
        return Err(ClientError::Api {
            code: envelope.code,
            message: envelope.message.unwrap_or_default(),
        });
    }
    envelope
        .data
        .ok_or_else(|| ClientError::MalformedResponse("success envelope without data".into()))
}
