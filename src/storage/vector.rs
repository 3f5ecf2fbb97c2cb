//! Pluggable vector search engines.
//!
//! Two engines share one contract: the accelerated engine backed by the
//! vec0 virtual table, and a brute-force engine that scans embedding blobs
//! in the chunks table. The vec0 index is an external accelerator, never
//! the source of truth; full chunk records are always rehydrated from the
//! chunks table afterwards.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::params;

use super::blob_to_vector;
use super::sqlite::SqliteStore;
use super::vector_to_blob;
use crate::error::NotebitErr;
use crate::error::Result;
use crate::types::ChunkHit;

/// Engine name for the accelerated vec0 engine.
pub const ENGINE_SQLITE_VEC: &str = "sqlite-vec";
/// Engine name for the brute-force fallback engine.
pub const ENGINE_BRUTE_FORCE: &str = "brute-force";

/// Contract shared by all vector search engines.
///
/// Results are sorted by descending similarity with ties broken by
/// ascending chunk id. Similarity is cosine-equivalent in [-1, 1].
#[async_trait]
pub trait VectorEngine: Send + Sync {
    /// Engine name, one of the `ENGINE_*` constants.
    fn name(&self) -> &'static str;

    /// Insert or replace a vector keyed by chunk id.
    async fn insert(&self, chunk_id: i64, vector: &[f32]) -> Result<()>;

    /// Delete vectors for the given chunk ids.
    async fn delete(&self, chunk_ids: &[i64]) -> Result<()>;

    /// Top-K nearest chunks for a query vector.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ChunkHit>>;

    /// Top-K for each query vector. Either every query succeeds or the
    /// whole call fails; no partial batches.
    async fn batch_search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<ChunkHit>>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.search(query, k).await?);
        }
        Ok(results)
    }
}

/// Instantiate an engine by name.
pub fn make_engine(name: &str, store: Arc<SqliteStore>) -> Result<Arc<dyn VectorEngine>> {
    match name {
        ENGINE_SQLITE_VEC => Ok(Arc::new(SqliteVecEngine::new(store))),
        ENGINE_BRUTE_FORCE => Ok(Arc::new(BruteForceEngine::new(store))),
        other => Err(NotebitErr::Config {
            field: "vector_search_engine".to_string(),
            cause: format!("unknown engine '{other}'"),
        }),
    }
}

/// Cosine similarity of two equal-length vectors, 0.0 for zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Sort hits by descending similarity, ties by ascending chunk id.
fn sort_hits(hits: &mut [ChunkHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
}

// ---------------------------------------------------------------------------
// Accelerated engine
// ---------------------------------------------------------------------------

/// KNN search through the vec0 virtual table.
pub struct SqliteVecEngine {
    store: Arc<SqliteStore>,
}

impl SqliteVecEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        let expected = self.store.dimension();
        if vector.len() != expected as usize {
            return Err(NotebitErr::DimensionMismatch {
                expected,
                actual: vector.len() as i32,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorEngine for SqliteVecEngine {
    fn name(&self) -> &'static str {
        ENGINE_SQLITE_VEC
    }

    async fn insert(&self, chunk_id: i64, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        let blob = vector_to_blob(vector);
        self.store
            .query(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO vec_chunks (chunk_id, embedding) VALUES (?1, ?2)",
                    params![chunk_id, blob],
                )
                .map_err(|e| NotebitErr::db("insert vector", e))?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, chunk_ids: &[i64]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let ids = chunk_ids.to_vec();
        self.store
            .query(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!("DELETE FROM vec_chunks WHERE chunk_id IN ({placeholders})");
                conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))
                    .map_err(|e| NotebitErr::db("delete vectors", e))?;
                Ok(())
            })
            .await
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ChunkHit>> {
        self.check_dimension(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let blob = vector_to_blob(query);

        self.store
            .query(move |conn| {
                // vec0 MATCH errors on an empty table; guard first.
                let has_vectors: bool = conn
                    .query_row("SELECT EXISTS(SELECT 1 FROM vec_chunks LIMIT 1)", [], |r| {
                        r.get(0)
                    })
                    .map_err(|e| NotebitErr::db("check vec_chunks non-empty", e))?;
                if !has_vectors {
                    return Ok(Vec::new());
                }

                let mut stmt = conn
                    .prepare(
                        "SELECT chunk_id, distance FROM vec_chunks
                         WHERE embedding MATCH ?1 AND k = ?2
                         ORDER BY distance",
                    )
                    .map_err(|e| NotebitErr::db("prepare vector search", e))?;

                let rows = stmt
                    .query_map(params![blob, k as i64], |row| {
                        let chunk_id: i64 = row.get(0)?;
                        let distance: f64 = row.get(1)?;
                        Ok(ChunkHit {
                            chunk_id,
                            // Cosine distance in [0, 2] maps to similarity
                            // in [-1, 1].
                            similarity: 1.0 - distance as f32,
                        })
                    })
                    .map_err(|e| NotebitErr::db("vector search", e))?;

                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(|e| NotebitErr::db("read vector hit", e))?);
                }
                sort_hits(&mut hits);
                Ok(hits)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Brute-force engine
// ---------------------------------------------------------------------------

/// Streams chunk embedding blobs and keeps a min-heap of size K.
///
/// Memory is O(K·D), not O(N·D). The chunks table is the data source, so
/// `insert`/`delete` are no-ops here; the repository maintains the blobs.
pub struct BruteForceEngine {
    store: Arc<SqliteStore>,
}

impl BruteForceEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

/// Heap entry ordered so the minimum is the worst hit: lowest similarity,
/// and among equal similarities the highest chunk id (evicted first so
/// ties resolve to ascending ids).
#[derive(Debug, PartialEq)]
struct HeapHit(ChunkHit);

impl Eq for HeapHit {}

impl Ord for HeapHit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .similarity
            .total_cmp(&other.0.similarity)
            .then(other.0.chunk_id.cmp(&self.0.chunk_id))
    }
}

impl PartialOrd for HeapHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[async_trait]
impl VectorEngine for BruteForceEngine {
    fn name(&self) -> &'static str {
        ENGINE_BRUTE_FORCE
    }

    async fn insert(&self, _chunk_id: i64, _vector: &[f32]) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _chunk_ids: &[i64]) -> Result<()> {
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ChunkHit>> {
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        let query = query.to_vec();

        self.store
            .query(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, embedding FROM chunks
                         WHERE embedding IS NOT NULL AND length(embedding) > 0",
                    )
                    .map_err(|e| NotebitErr::db("prepare brute-force scan", e))?;

                let rows = stmt
                    .query_map([], |row| {
                        let id: i64 = row.get(0)?;
                        let blob: Vec<u8> = row.get(1)?;
                        Ok((id, blob))
                    })
                    .map_err(|e| NotebitErr::db("brute-force scan", e))?;

                // Min-heap of the best K so far.
                let mut heap: BinaryHeap<std::cmp::Reverse<HeapHit>> = BinaryHeap::new();

                for row in rows {
                    let (chunk_id, blob) = row.map_err(|e| NotebitErr::db("read chunk row", e))?;
                    let Some(vector) = blob_to_vector(&blob) else {
                        tracing::debug!(chunk_id = chunk_id, "skipping malformed embedding blob");
                        continue;
                    };
                    if vector.len() != query.len() {
                        tracing::debug!(
                            chunk_id = chunk_id,
                            stored = vector.len(),
                            query = query.len(),
                            "skipping chunk with mismatched vector dimension"
                        );
                        continue;
                    }

                    let hit = ChunkHit {
                        chunk_id,
                        similarity: cosine_similarity(&query, &vector),
                    };
                    if heap.len() < k {
                        heap.push(std::cmp::Reverse(HeapHit(hit)));
                    } else if let Some(worst) = heap.peek() {
                        if HeapHit(hit) > worst.0 {
                            heap.pop();
                            heap.push(std::cmp::Reverse(HeapHit(hit)));
                        }
                    }
                }

                let mut hits: Vec<ChunkHit> =
                    heap.into_iter().map(|rev| rev.0 .0).collect();
                sort_hits(&mut hits);
                Ok(hits)
            })
            .await
    }
}
