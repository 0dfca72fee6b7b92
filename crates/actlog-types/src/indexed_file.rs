use serde::{Deserialize, Serialize};

/// Indexing metadata for one source file, keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedFile {
    pub path: String,
    /// Content hash at the time of indexing.
    pub hash: String,
    /// Milliseconds since the Unix epoch.
    pub indexed_at: i64,
    pub size: u64,
    pub chunks_count: u32,
}

impl IndexedFile {
    /// Whether a file with `hash` needs to be re-chunked.
    pub fn is_stale(&self, hash: &str) -> bool {
        self.hash != hash
    }
}
