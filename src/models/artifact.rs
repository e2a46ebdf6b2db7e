//! Represents a finished merged artifact.

use serde::{Deserialize, Serialize};

/// The outcome of a successful merge, whether synchronous or via a
/// completed task. Ownership passes to whichever collaborator requested
/// the upload (version registry, attachment record, ...); this
/// subsystem does not persist it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergedArtifact {
    /// Logical storage path of the artifact.
    pub file_path: String,

    /// Download URL for the artifact.
    pub file_url: String,

    /// Total size in bytes.
    pub file_size: i64,

    /// Opaque artifact identifier.
    pub file_id: String,
}
