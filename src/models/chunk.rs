//! Represents one received chunk of an upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single received chunk. Keyed by `(upload_id, idx)`; re-sending the
/// same pair overwrites the prior row and payload rather than creating
/// a duplicate, which is what makes retried uploads idempotent.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    /// Parent session.
    pub upload_id: String,

    /// 0-based chunk index.
    pub idx: i64,

    /// Storage key where the decoded bytes were persisted.
    pub storage_handle: String,

    /// Decoded size in bytes.
    pub size_bytes: i64,

    /// Timestamp of the most recent write for this index.
    pub received_at: DateTime<Utc>,
}
