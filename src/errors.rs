use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::{
    chunk_service::ChunkError, merge_service::MergeError, store::StoreError,
    task_store::TaskError,
};

/// A lightweight wrapper for handler errors that renders the protocol's
/// `{code, message}` envelope. The numeric `code` doubles as the HTTP
/// status of the response.
#[derive(Debug)]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

impl ApiError {
    /// Create a new ApiError with a specific code and message.
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(400, msg)
    }

    /// Shortcut for a 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(401, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(404, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(500, msg)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "code": self.code,
            "message": self.message
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<ChunkError> for ApiError {
    fn from(err: ChunkError) -> Self {
        let code = match &err {
            ChunkError::InvalidIndex { .. }
            | ChunkError::InvalidUploadId(_)
            | ChunkError::InvalidPayload(_)
            | ChunkError::InvalidDestPath => 400,
            ChunkError::SessionMismatch { .. } | ChunkError::SessionClosed { .. } => 409,
            ChunkError::Store(_) | ChunkError::Sqlx(_) => 500,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<MergeError> for ApiError {
    fn from(err: MergeError) -> Self {
        let code = match &err {
            MergeError::UnknownSession(_) => 404,
            MergeError::SessionMismatch { .. } => 400,
            MergeError::AlreadyMerging(_) | MergeError::SessionClosed { .. } => 409,
            MergeError::MissingChunk { .. } => 409,
            MergeError::Cancelled => 499,
            MergeError::Store(_) | MergeError::Sqlx(_) | MergeError::Task(_) => 500,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match &err {
            TaskError::NotFound(_) => ApiError::not_found(err.to_string()),
            TaskError::Terminal(_) => ApiError::new(409, err.to_string()),
            TaskError::Sqlx(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound(_) => ApiError::not_found(err.to_string()),
            StoreError::InvalidKey(_) => ApiError::bad_request(err.to_string()),
            StoreError::Io(_) => ApiError::internal(err.to_string()),
        }
    }
}
