//! Storage layer: SQLite store, repository, vector engines and migration.

pub mod migrate;
pub mod repository;
pub mod sqlite;
pub mod vector;

pub use migrate::VectorMigrator;
pub use repository::NoteRepository;
pub use sqlite::SqliteStore;
pub use vector::BruteForceEngine;
pub use vector::SqliteVecEngine;
pub use vector::VectorEngine;

use zerocopy::AsBytes;

/// Serialize an f32 vector as raw little-endian bytes.
///
/// This is the format both the `embedding` blob column and the vec0
/// virtual table use.
pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.as_bytes().to_vec()
}

/// Deserialize an embedding blob back into an f32 vector.
///
/// Returns `None` when the blob length is not a multiple of 4.
pub(crate) fn blob_to_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}
