//! Handlers for chunk upload, completion, task status, and artifact
//! download. Thin layer over `RelayService`; all protocol decisions
//! (idempotence, completeness, merge strategy) live in the services.

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::{
    errors::ApiError,
    handlers::ok,
    models::wire::{
        CHUNK_ENVELOPE_HEADER, CHUNK_ENVELOPE_JSON, ChunkEnvelope, CompleteRequest,
        TaskStatusData,
    },
    services::{RelayService, store::ObjectStore},
};

/// Query params for `GET /v1/tasks/status`.
#[derive(Debug, Deserialize)]
pub struct TaskStatusQuery {
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// `POST /v1/chunks` — one chunk envelope per call.
///
/// The body is logically JSON but must arrive under a binary
/// content-type with the `x-chunk-envelope: json` marker; text-typed
/// bodies are subject to a far smaller size ceiling on the transport
/// and are rejected outright so senders fail loudly instead of flaking
/// on large chunks.
pub async fn upload_chunk(
    State(service): State<RelayService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with("text/") {
        return Err(ApiError::bad_request(
            "chunk envelope must be sent with a binary content-type",
        ));
    }

    let marker = headers
        .get(CHUNK_ENVELOPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if marker != CHUNK_ENVELOPE_JSON {
        return Err(ApiError::bad_request(format!(
            "missing or invalid `{}` header",
            CHUNK_ENVELOPE_HEADER
        )));
    }

    let envelope: ChunkEnvelope = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("malformed chunk envelope: {err}")))?;

    let receipt = service.receive_chunk(envelope).await?;
    Ok(ok(receipt))
}

/// `POST /v1/chunks/complete` — the sender believes every chunk is in.
pub async fn complete_upload(
    State(service): State<RelayService>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    let data = service.complete_upload(req).await?;
    Ok(ok(data))
}

/// `GET /v1/tasks/status?taskId=` — poll a merge task.
pub async fn task_status(
    State(service): State<RelayService>,
    Query(query): Query<TaskStatusQuery>,
) -> Result<Json<Value>, ApiError> {
    let task = service.get_task(&query.task_id).await?;
    Ok(ok(TaskStatusData {
        status: task.status(),
        progress: task.progress,
        file_path: task.file_path,
        file_url: task.file_url,
        file_size: task.file_size,
        file_id: task.file_id,
        error: task.error,
    }))
}

/// `GET /v1/files/{*path}` — stream a stored object (merged artifacts
/// and, in deferred mode, raw chunks).
pub async fn download_file(
    State(service): State<RelayService>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let (len, reader) = service.store.reader(&path).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&len.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    Ok(response)
}
