//! Wire types for the transfer protocol.
//!
//! Chunk envelopes use deliberately short field names to keep the JSON
//! framing overhead small next to the base64 payload. The envelope is
//! posted under a *binary* content-type with an `x-chunk-envelope: json`
//! marker header — text-typed bodies are subject to a much smaller size
//! ceiling on the transport, so the sender must never use one.

use serde::{Deserialize, Serialize};

use crate::models::artifact::MergedArtifact;
use crate::models::task::TaskStatus;

/// Header marking a binary body as a JSON chunk envelope.
pub const CHUNK_ENVELOPE_HEADER: &str = "x-chunk-envelope";

/// Expected value of [`CHUNK_ENVELOPE_HEADER`].
pub const CHUNK_ENVELOPE_JSON: &str = "json";

/// One chunk call: `POST /v1/chunks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Upload session id.
    #[serde(rename = "u")]
    pub upload_id: String,

    /// 0-based chunk index.
    #[serde(rename = "i")]
    pub index: u32,

    /// Total number of chunks in the session.
    #[serde(rename = "t")]
    pub total_chunks: u32,

    /// Logical destination path of the final artifact.
    #[serde(rename = "p")]
    pub dest_path: String,

    /// Base64-encoded chunk bytes.
    #[serde(rename = "d")]
    pub data: String,
}

/// Completion call: `POST /v1/chunks/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(rename = "u")]
    pub upload_id: String,

    #[serde(rename = "t")]
    pub total_chunks: u32,

    #[serde(rename = "p")]
    pub dest_path: String,

    /// Optional artifact file name appended beneath `dest_path`.
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Storage handles returned by each chunk call, in index order.
    /// Supplying them enables the cheap handle-based merge decision.
    #[serde(rename = "fids", default, skip_serializing_if = "Option::is_none")]
    pub chunk_handles: Option<Vec<String>>,
}

/// Per-chunk acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    /// Storage handle for the persisted chunk.
    #[serde(rename = "fileID")]
    pub file_id: String,

    pub chunk_index: u32,

    pub received: bool,
}

/// Handle returned when the merge runs in the background.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub task_id: String,

    /// Where to poll: `/v1/tasks/status?taskId=...`.
    pub status_url: String,

    pub progress: i64,
}

/// The three possible shapes of a completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompleteData {
    /// The merge ran synchronously; the artifact is ready.
    Merged(MergedArtifact),

    /// The merge runs in the background; poll the task.
    Task(TaskHandle),

    /// The server defers merging; the caller downloads and concatenates.
    Deferred(DeferredChunks),
}

/// Chunk download URLs in ascending index order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredChunks {
    pub chunk_urls: Vec<String>,
}

/// Task status response: `GET /v1/tasks/status?taskId=`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusData {
    pub status: TaskStatus,

    pub progress: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Generic `{code, data, message}` response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_envelope_uses_short_keys() {
        let env = ChunkEnvelope {
            upload_id: "u1".into(),
            index: 2,
            total_chunks: 3,
            dest_path: "pkg/app.apk".into(),
            data: "AAAA".into(),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["u"], "u1");
        assert_eq!(json["i"], 2);
        assert_eq!(json["t"], 3);
        assert_eq!(json["p"], "pkg/app.apk");
        assert_eq!(json["d"], "AAAA");
    }

    #[test]
    fn complete_data_distinguishes_response_shapes() {
        let merged: CompleteData = serde_json::from_str(
            r#"{"filePath":"a","fileUrl":"/v1/files/a","fileSize":5,"fileId":"x"}"#,
        )
        .unwrap();
        assert!(matches!(merged, CompleteData::Merged(_)));

        let task: CompleteData = serde_json::from_str(
            r#"{"taskId":"t1","statusUrl":"/v1/tasks/status?taskId=t1","progress":0}"#,
        )
        .unwrap();
        assert!(matches!(task, CompleteData::Task(_)));

        let deferred: CompleteData =
            serde_json::from_str(r#"{"chunkUrls":["/v1/files/c0","/v1/files/c1"]}"#).unwrap();
        assert!(matches!(deferred, CompleteData::Deferred(_)));
    }
}
