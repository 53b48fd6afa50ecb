//! Partitions of a manifest and the per-chunk results workers report.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An ordered, disjoint slice of the manifest assigned to one worker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// 0-based position of this chunk within the run.
    pub chunk_index: u32,
    /// Source keys in manifest order.
    pub keys: Vec<String>,
}

/// What a chunk worker reports once its slice is fully staged.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub chunk_index: i64,
    pub files_added: i64,
    pub duration_ms: i64,
}
