//! Core data types for the vault index.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// Indexed note file record.
///
/// Identity is the path relative to the vault root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteFile {
    /// Row id assigned by the database.
    pub id: i64,
    /// Path relative to the vault root, `/`-separated.
    pub path: String,
    /// Derived title: first `# ` heading, else the file stem.
    pub title: String,
    /// SHA-256 of the byte-for-byte file content, lowercase hex.
    pub content_hash: String,
    /// Last-modified unix timestamp of the underlying file.
    pub mtime: i64,
    /// File size in bytes.
    pub size: i64,
    /// Record creation timestamp.
    pub created_at: i64,
    /// Record update timestamp.
    pub updated_at: i64,
}

/// A contiguous text segment extracted from a note.
///
/// Chunk ids are opaque, monotonically assigned integers; all chunks of a
/// file are deleted and recreated atomically on each reindex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteChunk {
    pub id: i64,
    /// Owning file id; deletion cascades.
    pub file_id: i64,
    /// Ordinal position within the file.
    pub position: i32,
    /// Chunk text.
    pub content: String,
    /// Nearest enclosing heading, empty when none.
    pub heading: String,
    /// Dense embedding vector, absent until embedded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Name of the model that produced the embedding.
    pub embedding_model: String,
    /// When the embedding was created, `None` until embedded.
    pub embedded_at: Option<i64>,
    /// Whether the vector is present in the accelerated index.
    pub vec_indexed: bool,
}

/// Chunk produced by the chunker, before it has a database identity.
#[derive(Debug, Clone)]
pub struct ChunkInput {
    pub position: i32,
    pub content: String,
    pub heading: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: String,
}

/// Raw hit from a vector engine: chunk id plus similarity in [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHit {
    pub chunk_id: i64,
    pub similarity: f32,
}

/// Search result hydrated with file metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarNote {
    pub chunk_id: i64,
    pub path: String,
    pub title: String,
    pub heading: String,
    pub content: String,
    pub similarity: f32,
}

/// Aggregate index statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub file_count: i64,
    pub chunk_count: i64,
    /// Chunks carrying an embedding blob.
    pub embedded_chunk_count: i64,
    /// Chunks present in the accelerated vector index.
    pub vec_indexed_count: i64,
    pub db_size_bytes: i64,
}

/// Compute the SHA-256 content hash of a note, lowercase hex.
///
/// Hashed byte-for-byte; no whitespace canonicalization.
pub fn content_hash(content: &str) -> String {
    let hash = Sha256::digest(content.as_bytes());
    hex::encode(hash)
}

/// Extract a note title from its content.
///
/// Scans for the first top-level Markdown heading after normalizing line
/// endings; falls back to the file stem when no heading exists.
pub fn extract_title(path: &str, content: &str) -> String {
    for line in content.replace("\r\n", "\n").lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("# ") {
            let title = rest.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// True for paths the indexer considers markdown notes.
pub fn is_markdown_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

/// Current unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
