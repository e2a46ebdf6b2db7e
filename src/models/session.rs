//! Represents an upload session — the logical grouping of all chunk
//! calls sharing one `uploadId`, destined for one output artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of a session. A session is implicitly created `Open` by
/// the first chunk call carrying its `uploadId`, transitions to
/// `Merging` via a conditional write when a completion call claims it,
/// and ends `Done` or `Failed`. Sessions are never deleted here;
/// orphans are left to an external sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Merging,
    Done,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Merging => "merging",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(SessionState::Open),
            "merging" => Some(SessionState::Merging),
            "done" => Some(SessionState::Done),
            "failed" => Some(SessionState::Failed),
            _ => None,
        }
    }
}

/// A persisted upload session row.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Opaque, globally-unique token minted by the sender.
    pub upload_id: String,

    /// Logical destination path for the merged artifact.
    pub dest_path: String,

    /// Number of chunks the sender declared for this session.
    pub total_chunks: i64,

    /// Decoded size of the first received chunk (bytes); informational.
    pub chunk_size: i64,

    /// Current lifecycle state (`open`, `merging`, `done`, `failed`).
    pub state: String,

    /// Timestamp of the first chunk call.
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn state(&self) -> SessionState {
        SessionState::parse(&self.state).unwrap_or(SessionState::Failed)
    }
}
