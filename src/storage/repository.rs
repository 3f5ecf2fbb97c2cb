//! Durable mapping of files, chunks and embeddings.
//!
//! All mutating operations run in a single transaction and bump the
//! repository revision on success; readers never take write transactions.
//! The repository also owns the current vector engine and the transparent
//! fallback to brute force.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use rusqlite::params;
use rusqlite::Connection;
use serde::Serialize;

use super::blob_to_vector;
use super::sqlite::SqliteStore;
use super::vector::make_engine;
use super::vector::VectorEngine;
use super::vector::ENGINE_BRUTE_FORCE;
use super::vector_to_blob;
use crate::error::NotebitErr;
use crate::error::OptionalExt;
use crate::error::Result;
use crate::types::content_hash;
use crate::types::extract_title;
use crate::types::now_timestamp;
use crate::types::ChunkHit;
use crate::types::ChunkInput;
use crate::types::DatabaseStats;
use crate::types::NoteChunk;
use crate::types::NoteFile;
use crate::types::SimilarNote;

/// Requested vs effective vector engine.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EngineSelection {
    pub requested: String,
    pub effective: String,
}

/// Repository over the index database.
pub struct NoteRepository {
    store: Arc<SqliteStore>,
    /// Monotonic revision, bumped on every successful write that can
    /// affect query results. Consumers use it for cache invalidation.
    revision: AtomicI64,
    /// Currently selected engine. Swapped whole on selection; callers
    /// clone the Arc out and never hold the guard across awaits.
    engine: RwLock<Arc<dyn VectorEngine>>,
    /// Engine the caller asked for, plus the engine actually serving.
    selection: RwLock<EngineSelection>,
}

impl NoteRepository {
    /// Create a repository with the named engine selected.
    pub fn new(store: Arc<SqliteStore>, engine_name: &str) -> Result<Self> {
        let engine = make_engine(engine_name, store.clone())?;
        Ok(Self {
            store,
            revision: AtomicI64::new(0),
            selection: RwLock::new(EngineSelection {
                requested: engine_name.to_string(),
                effective: engine_name.to_string(),
            }),
            engine: RwLock::new(engine),
        })
    }

    /// Underlying store (shared with the migrator).
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Current repository revision.
    pub fn revision(&self) -> i64 {
        self.revision.load(Ordering::Acquire)
    }

    fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Engine selection
    // ------------------------------------------------------------------

    /// Switch the vector engine. Returns the requested and effective names
    /// (identical until a search failure triggers fallback).
    pub fn select_vector_engine(&self, name: &str) -> Result<EngineSelection> {
        let engine = make_engine(name, self.store.clone())?;
        *self.engine.write().unwrap_or_else(|p| p.into_inner()) = engine;
        let selection = EngineSelection {
            requested: name.to_string(),
            effective: name.to_string(),
        };
        *self.selection.write().unwrap_or_else(|p| p.into_inner()) = selection.clone();
        tracing::info!(engine = name, "Vector engine selected");
        Ok(selection)
    }

    /// Requested and effective engine names.
    pub fn current_vector_engine(&self) -> EngineSelection {
        self.selection
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn current_engine(&self) -> Arc<dyn VectorEngine> {
        self.engine
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn record_fallback(&self) {
        let mut selection = self.selection.write().unwrap_or_else(|p| p.into_inner());
        selection.effective = ENGINE_BRUTE_FORCE.to_string();
    }

    #[cfg(test)]
    pub(crate) fn install_engine(&self, requested: &str, engine: Arc<dyn VectorEngine>) {
        *self.engine.write().unwrap_or_else(|p| p.into_inner()) = engine;
        *self.selection.write().unwrap_or_else(|p| p.into_inner()) = EngineSelection {
            requested: requested.to_string(),
            effective: requested.to_string(),
        };
    }

    /// Search with transparent fallback: a failure from any non-default
    /// engine retries on brute force for this call and records the
    /// effective engine.
    pub async fn search_raw(&self, query: &[f32], k: usize) -> Result<Vec<ChunkHit>> {
        let engine = self.current_engine();
        match engine.search(query, k).await {
            Ok(hits) => Ok(hits),
            Err(e) if engine.name() != ENGINE_BRUTE_FORCE => {
                tracing::warn!(
                    engine = engine.name(),
                    error = %e,
                    "Vector engine failed, falling back to brute force"
                );
                self.record_fallback();
                let fallback = make_engine(ENGINE_BRUTE_FORCE, self.store.clone())?;
                fallback.search(query, k).await
            }
            Err(e) => Err(e),
        }
    }

    /// Batched search with the same fallback semantics; all-or-nothing.
    pub async fn batch_search_raw(
        &self,
        queries: &[Vec<f32>],
        k: usize,
    ) -> Result<Vec<Vec<ChunkHit>>> {
        let engine = self.current_engine();
        match engine.batch_search(queries, k).await {
            Ok(hits) => Ok(hits),
            Err(e) if engine.name() != ENGINE_BRUTE_FORCE => {
                tracing::warn!(
                    engine = engine.name(),
                    error = %e,
                    "Vector engine batch failed, falling back to brute force"
                );
                self.record_fallback();
                let fallback = make_engine(ENGINE_BRUTE_FORCE, self.store.clone())?;
                fallback.batch_search(queries, k).await
            }
            Err(e) => Err(e),
        }
    }

    /// Top-K similar chunks hydrated with file metadata.
    ///
    /// Hydration is a single batched lookup; hits whose owning file was
    /// deleted concurrently are dropped.
    pub async fn search_similar(&self, query: &[f32], k: usize) -> Result<Vec<SimilarNote>> {
        let hits = self.search_raw(query, k).await?;
        self.hydrate_hits(hits).await
    }

    async fn hydrate_hits(&self, hits: Vec<ChunkHit>) -> Result<Vec<SimilarNote>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = hits.iter().map(|h| h.chunk_id).collect();

        let rows: HashMap<i64, (String, String, String, String)> = self
            .store
            .query(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!(
                    "SELECT c.id, f.path, f.title, c.heading, c.content
                     FROM chunks c JOIN files f ON f.id = c.file_id
                     WHERE c.id IN ({placeholders})"
                );
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| NotebitErr::db("prepare hydrate", e))?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            (row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
                        ))
                    })
                    .map_err(|e| NotebitErr::db("hydrate chunks", e))?;
                let mut map = HashMap::new();
                for row in rows {
                    let (id, data) = row.map_err(|e| NotebitErr::db("read hydrated row", e))?;
                    map.insert(id, data);
                }
                Ok(map)
            })
            .await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                rows.get(&hit.chunk_id)
                    .map(|(path, title, heading, content)| SimilarNote {
                        chunk_id: hit.chunk_id,
                        path: path.clone(),
                        title: title.clone(),
                        heading: heading.clone(),
                        content: content.clone(),
                        similarity: hit.similarity,
                    })
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Make `(path, content)` durable: upsert the file row, replace all its
    /// chunks, and maintain the vector index, atomically.
    ///
    /// A failed vec0 insert for a subset of chunks does not abort the
    /// transaction; affected chunks commit with `vec_indexed = 0` so text
    /// retrieval keeps working and the migrator can repair later.
    pub async fn index_file(
        &self,
        path: &str,
        content: &str,
        mtime: i64,
        size: i64,
        chunks: Vec<ChunkInput>,
    ) -> Result<i64> {
        let log_path = path.to_string();
        let path = path.to_string();
        let title = extract_title(&path, content);
        let hash = content_hash(content);
        let now = now_timestamp();
        let dimension = self.store.dimension() as usize;

        let file_id = self
            .store
            .transaction(move |conn| {
                conn.execute(
                    "INSERT INTO files (path, title, content_hash, mtime, size, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(path) DO UPDATE SET
                         title = excluded.title,
                         content_hash = excluded.content_hash,
                         mtime = excluded.mtime,
                         size = excluded.size,
                         updated_at = excluded.updated_at",
                    params![path, title, hash, mtime, size, now],
                )
                .map_err(|e| NotebitErr::db("upsert file", e))?;

                let file_id: i64 = conn
                    .query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| {
                        r.get(0)
                    })
                    .map_err(|e| NotebitErr::db("read file id", e))?;

                delete_chunks_for_file(conn, file_id)?;

                let mut chunk_stmt = conn
                    .prepare_cached(
                        "INSERT INTO chunks
                         (file_id, position, content, heading, embedding, embedding_model, embedded_at, vec_indexed)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .map_err(|e| NotebitErr::db("prepare chunk insert", e))?;

                for chunk in &chunks {
                    let blob = chunk.embedding.as_ref().map(|v| vector_to_blob(v));
                    let embedded_at = chunk.embedding.as_ref().map(|_| now);
                    chunk_stmt
                        .execute(params![
                            file_id,
                            chunk.position,
                            chunk.content,
                            chunk.heading,
                            blob,
                            chunk.embedding_model,
                            embedded_at,
                            0,
                        ])
                        .map_err(|e| NotebitErr::db("insert chunk", e))?;
                    let chunk_id = conn.last_insert_rowid();

                    let Some(vector) = &chunk.embedding else {
                        continue;
                    };
                    if vector.len() != dimension {
                        tracing::debug!(
                            chunk_id = chunk_id,
                            stored = vector.len(),
                            expected = dimension,
                            "embedding dimension differs from schema, leaving vec_indexed unset"
                        );
                        continue;
                    }
                    match conn.execute(
                        "INSERT OR REPLACE INTO vec_chunks (chunk_id, embedding) VALUES (?1, ?2)",
                        params![chunk_id, vector_to_blob(vector)],
                    ) {
                        Ok(_) => {
                            conn.execute(
                                "UPDATE chunks SET vec_indexed = 1 WHERE id = ?1",
                                params![chunk_id],
                            )
                            .map_err(|e| NotebitErr::db("mark vec_indexed", e))?;
                        }
                        Err(e) => {
                            tracing::debug!(
                                chunk_id = chunk_id,
                                error = %e,
                                "vector index insert failed, chunk committed without it"
                            );
                        }
                    }
                }

                Ok(file_id)
            })
            .await?;

        self.bump_revision();
        tracing::debug!(path = %log_path, file_id = file_id, "indexed file");
        Ok(file_id)
    }

    /// True when the path has no file row, the stored hash differs from
    /// the content hash, or any chunk lacks an embedding blob.
    pub async fn file_needs_indexing(&self, path: &str, content: &str) -> Result<bool> {
        let path = path.to_string();
        let hash = content_hash(content);

        self.store
            .query(move |conn| {
                let row: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT id, content_hash FROM files WHERE path = ?1",
                        params![path],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;

                let Some((file_id, stored_hash)) = row else {
                    return Ok(true);
                };
                if stored_hash != hash {
                    return Ok(true);
                }

                let missing: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM chunks
                         WHERE file_id = ?1
                           AND (embedding IS NULL OR length(embedding) = 0)",
                        params![file_id],
                        |r| r.get(0),
                    )
                    .map_err(|e| NotebitErr::db("count unembedded chunks", e))?;
                Ok(missing > 0)
            })
            .await
    }

    /// Delete a file and cascade to its chunks and vector entries.
    /// Returns false when the path was not indexed.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        let deleted = self
            .store
            .transaction(move |conn| {
                let file_id: Option<i64> = conn
                    .query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| {
                        r.get(0)
                    })
                    .optional()?;
                let Some(file_id) = file_id else {
                    return Ok(false);
                };
                delete_chunks_for_file(conn, file_id)?;
                conn.execute("DELETE FROM files WHERE id = ?1", params![file_id])
                    .map_err(|e| NotebitErr::db("delete file", e))?;
                Ok(true)
            })
            .await?;

        if deleted {
            self.bump_revision();
        }
        Ok(deleted)
    }

    /// Rewrite a file's path. Chunks and vectors stay attached.
    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_path = old_path.to_string();
        let new_path = new_path.to_string();
        let now = now_timestamp();

        let changed = self
            .store
            .transaction(move |conn| {
                let affected = conn
                    .execute(
                        "UPDATE files SET path = ?1, updated_at = ?2 WHERE path = ?3",
                        params![new_path, now, old_path],
                    )
                    .map_err(|e| NotebitErr::db("rename file", e))?;
                if affected == 0 {
                    return Err(NotebitErr::NotFound {
                        what: "file",
                        key: old_path.clone(),
                    });
                }
                Ok(affected > 0)
            })
            .await?;

        if changed {
            self.bump_revision();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    pub async fn list_files(&self) -> Result<Vec<NoteFile>> {
        self.store
            .query(|conn| {
                let mut stmt = conn
                    .prepare(&format!("{FILE_SELECT} ORDER BY path"))
                    .map_err(|e| NotebitErr::db("prepare list files", e))?;
                let rows = stmt
                    .query_map([], map_file_row)
                    .map_err(|e| NotebitErr::db("list files", e))?;
                collect_rows(rows, "read file row")
            })
            .await
    }

    /// Files that currently own at least one chunk, with their chunk count.
    pub async fn list_files_with_chunks(&self) -> Result<Vec<(NoteFile, i64)>> {
        self.store
            .query(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT f.id, f.path, f.title, f.content_hash, f.mtime, f.size,
                                f.created_at, f.updated_at, COUNT(c.id) AS chunk_count
                         FROM files f JOIN chunks c ON c.file_id = f.id
                         GROUP BY f.id
                         ORDER BY f.id",
                    )
                    .map_err(|e| NotebitErr::db("prepare list files with chunks", e))?;
                let rows = stmt
                    .query_map([], |row| Ok((map_file_row(row)?, row.get::<_, i64>(8)?)))
                    .map_err(|e| NotebitErr::db("list files with chunks", e))?;
                collect_rows(rows, "read file row")
            })
            .await
    }

    pub async fn get_file_by_path(&self, path: &str) -> Result<Option<NoteFile>> {
        let path = path.to_string();
        self.store
            .query(move |conn| {
                conn.query_row(
                    &format!("{FILE_SELECT} WHERE path = ?1"),
                    params![path],
                    map_file_row,
                )
                .optional()
            })
            .await
    }

    pub async fn get_chunks_by_file_id(&self, file_id: i64) -> Result<Vec<NoteChunk>> {
        self.store
            .query(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, file_id, position, content, heading, embedding,
                                embedding_model, embedded_at, vec_indexed
                         FROM chunks WHERE file_id = ?1 ORDER BY position",
                    )
                    .map_err(|e| NotebitErr::db("prepare chunks by file", e))?;
                let rows = stmt
                    .query_map(params![file_id], map_chunk_row)
                    .map_err(|e| NotebitErr::db("chunks by file", e))?;
                collect_rows(rows, "read chunk row")
            })
            .await
    }

    /// First chunk of each file, ordered by file id, at most `limit` files.
    /// Used for implicit-edge computation.
    pub async fn first_chunks(&self, limit: usize) -> Result<Vec<(i64, NoteChunk)>> {
        self.store
            .query(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT c.id, c.file_id, c.position, c.content, c.heading, c.embedding,
                                c.embedding_model, c.embedded_at, c.vec_indexed
                         FROM chunks c
                         JOIN (SELECT file_id, MIN(position) AS min_pos
                               FROM chunks GROUP BY file_id) fc
                           ON fc.file_id = c.file_id AND fc.min_pos = c.position
                         ORDER BY c.file_id
                         LIMIT ?1",
                    )
                    .map_err(|e| NotebitErr::db("prepare first chunks", e))?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| {
                        let chunk = map_chunk_row(row)?;
                        Ok((chunk.file_id, chunk))
                    })
                    .map_err(|e| NotebitErr::db("first chunks", e))?;
                collect_rows(rows, "read first chunk")
            })
            .await
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats> {
        self.store
            .query(|conn| {
                let file_count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
                    .map_err(|e| NotebitErr::db("count files", e))?;
                let chunk_count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
                    .map_err(|e| NotebitErr::db("count chunks", e))?;
                let embedded_chunk_count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM chunks
                         WHERE embedding IS NOT NULL AND length(embedding) > 0",
                        [],
                        |r| r.get(0),
                    )
                    .map_err(|e| NotebitErr::db("count embedded chunks", e))?;
                let vec_indexed_count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM chunks WHERE vec_indexed = 1",
                        [],
                        |r| r.get(0),
                    )
                    .map_err(|e| NotebitErr::db("count vec_indexed", e))?;
                let db_size_bytes: i64 = conn
                    .query_row(
                        "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap_or(0);

                Ok(DatabaseStats {
                    file_count,
                    chunk_count,
                    embedded_chunk_count,
                    vec_indexed_count,
                    db_size_bytes,
                })
            })
            .await
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    /// Replace the tag set of a file. Tags are user-authored; nothing in
    /// the core populates them automatically.
    pub async fn set_file_tags(&self, path: &str, tags: &[String]) -> Result<()> {
        let path = path.to_string();
        let tags: Vec<String> = tags.to_vec();
        self.store
            .transaction(move |conn| {
                let file_id: i64 = conn
                    .query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| {
                        r.get(0)
                    })
                    .optional()?
                    .ok_or_else(|| NotebitErr::NotFound {
                        what: "file",
                        key: path.clone(),
                    })?;

                conn.execute("DELETE FROM file_tags WHERE file_id = ?1", params![file_id])
                    .map_err(|e| NotebitErr::db("clear file tags", e))?;

                for tag in &tags {
                    conn.execute(
                        "INSERT OR IGNORE INTO tags (name) VALUES (?1)",
                        params![tag],
                    )
                    .map_err(|e| NotebitErr::db("insert tag", e))?;
                    conn.execute(
                        "INSERT OR IGNORE INTO file_tags (file_id, tag_id)
                         SELECT ?1, id FROM tags WHERE name = ?2",
                        params![file_id, tag],
                    )
                    .map_err(|e| NotebitErr::db("link tag", e))?;
                }
                Ok(())
            })
            .await
    }

    pub async fn get_file_tags(&self, path: &str) -> Result<Vec<String>> {
        let path = path.to_string();
        self.store
            .query(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT t.name FROM tags t
                         JOIN file_tags ft ON ft.tag_id = t.id
                         JOIN files f ON f.id = ft.file_id
                         WHERE f.path = ?1 ORDER BY t.name",
                    )
                    .map_err(|e| NotebitErr::db("prepare file tags", e))?;
                let rows = stmt
                    .query_map(params![path], |r| r.get::<_, String>(0))
                    .map_err(|e| NotebitErr::db("file tags", e))?;
                collect_rows(rows, "read tag")
            })
            .await
    }

    pub async fn list_tags(&self) -> Result<Vec<String>> {
        self.store
            .query(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM tags ORDER BY name")
                    .map_err(|e| NotebitErr::db("prepare list tags", e))?;
                let rows = stmt
                    .query_map([], |r| r.get::<_, String>(0))
                    .map_err(|e| NotebitErr::db("list tags", e))?;
                collect_rows(rows, "read tag")
            })
            .await
    }
}

/// Delete all chunks of a file and their vector-index entries.
fn delete_chunks_for_file(conn: &Connection, file_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM vec_chunks WHERE chunk_id IN (SELECT id FROM chunks WHERE file_id = ?1)",
        params![file_id],
    )
    .map_err(|e| NotebitErr::db("delete vectors for file", e))?;
    conn.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])
        .map_err(|e| NotebitErr::db("delete chunks for file", e))?;
    Ok(())
}

const FILE_SELECT: &str = "SELECT id, path, title, content_hash, mtime, size, created_at, \
                           updated_at FROM files";

fn map_file_row(row: &rusqlite::Row) -> rusqlite::Result<NoteFile> {
    Ok(NoteFile {
        id: row.get(0)?,
        path: row.get(1)?,
        title: row.get(2)?,
        content_hash: row.get(3)?,
        mtime: row.get(4)?,
        size: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_chunk_row(row: &rusqlite::Row) -> rusqlite::Result<NoteChunk> {
    let blob: Option<Vec<u8>> = row.get(5)?;
    let vec_indexed: i64 = row.get(8)?;
    Ok(NoteChunk {
        id: row.get(0)?,
        file_id: row.get(1)?,
        position: row.get(2)?,
        content: row.get(3)?,
        heading: row.get(4)?,
        embedding: blob.as_deref().and_then(blob_to_vector),
        embedding_model: row.get(6)?,
        embedded_at: row.get(7)?,
        vec_indexed: vec_indexed != 0,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    operation: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| NotebitErr::db(operation, e))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const DIM: i32 = 3;

    async fn setup() -> (TempDir, NoteRepository) {
        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(SqliteStore::open(&dir.path().join("data/notebit.sqlite"), DIM).unwrap());
        let repo = NoteRepository::new(store, "sqlite-vec").unwrap();
        (dir, repo)
    }

    fn chunk(position: i32, content: &str, embedding: Option<Vec<f32>>) -> ChunkInput {
        ChunkInput {
            position,
            content: content.to_string(),
            heading: String::new(),
            embedding,
            embedding_model: "test-model".to_string(),
        }
    }

    #[tokio::test]
    async fn test_index_file_creates_records() {
        let (_dir, repo) = setup().await;
        let content = "# Alpha\n\nThe quick brown fox";
        repo.index_file(
            "a.md",
            content,
            100,
            content.len() as i64,
            vec![chunk(0, "The quick brown fox", Some(vec![1.0, 0.0, 0.0]))],
        )
        .await
        .unwrap();

        let file = repo.get_file_by_path("a.md").await.unwrap().unwrap();
        assert_eq!(file.title, "Alpha");
        assert_eq!(file.content_hash, content_hash(content));

        let chunks = repo.get_chunks_by_file_id(file.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].vec_indexed);
        assert_eq!(chunks[0].embedding.as_deref(), Some(&[1.0, 0.0, 0.0][..]));
        assert!(chunks[0].embedded_at.is_some());
    }

    #[tokio::test]
    async fn test_reindex_replaces_chunks_and_ids_are_monotonic() {
        let (_dir, repo) = setup().await;
        repo.index_file(
            "a.md",
            "v1",
            1,
            2,
            vec![
                chunk(0, "one", Some(vec![1.0, 0.0, 0.0])),
                chunk(1, "two", Some(vec![0.0, 1.0, 0.0])),
            ],
        )
        .await
        .unwrap();
        let file = repo.get_file_by_path("a.md").await.unwrap().unwrap();
        let first_ids: Vec<i64> = repo
            .get_chunks_by_file_id(file.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();

        repo.index_file("a.md", "v2", 2, 2, vec![chunk(0, "three", None)])
            .await
            .unwrap();
        let chunks = repo.get_chunks_by_file_id(file.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        // Ids are never reused.
        assert!(chunks[0].id > *first_ids.iter().max().unwrap());
    }

    #[tokio::test]
    async fn test_file_needs_indexing() {
        let (_dir, repo) = setup().await;
        assert!(repo.file_needs_indexing("a.md", "content").await.unwrap());

        repo.index_file(
            "a.md",
            "content",
            1,
            7,
            vec![chunk(0, "content", Some(vec![1.0, 0.0, 0.0]))],
        )
        .await
        .unwrap();
        assert!(!repo.file_needs_indexing("a.md", "content").await.unwrap());
        // Hash mismatch.
        assert!(repo.file_needs_indexing("a.md", "changed").await.unwrap());

        // Chunk without an embedding forces a reindex.
        repo.index_file("b.md", "other", 1, 5, vec![chunk(0, "other", None)])
            .await
            .unwrap();
        assert!(repo.file_needs_indexing("b.md", "other").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (_dir, repo) = setup().await;
        repo.index_file(
            "a.md",
            "content",
            1,
            7,
            vec![chunk(0, "content", Some(vec![1.0, 0.0, 0.0]))],
        )
        .await
        .unwrap();

        assert!(repo.delete_file("a.md").await.unwrap());
        assert!(repo.get_file_by_path("a.md").await.unwrap().is_none());

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.vec_indexed_count, 0);

        // Vector search finds nothing.
        let hits = repo.search_raw(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert!(hits.is_empty());

        // Deleting again reports not-found without error.
        assert!(!repo.delete_file("a.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_preserves_chunks() {
        let (_dir, repo) = setup().await;
        repo.index_file(
            "a.md",
            "# T\nbody",
            1,
            8,
            vec![chunk(0, "body", Some(vec![0.0, 1.0, 0.0]))],
        )
        .await
        .unwrap();

        repo.rename_file("a.md", "notes/a.md").await.unwrap();
        assert!(repo.get_file_by_path("a.md").await.unwrap().is_none());
        let file = repo.get_file_by_path("notes/a.md").await.unwrap().unwrap();
        let chunks = repo.get_chunks_by_file_id(file.id).await.unwrap();
        assert_eq!(chunks.len(), 1);

        let results = repo.search_similar(&[0.0, 1.0, 0.0], 3).await.unwrap();
        assert_eq!(results[0].path, "notes/a.md");
    }

    #[tokio::test]
    async fn test_rename_missing_file_errors() {
        let (_dir, repo) = setup().await;
        let err = repo.rename_file("nope.md", "new.md").await.unwrap_err();
        assert!(matches!(err, NotebitErr::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_revision_monotonic() {
        let (_dir, repo) = setup().await;
        let r0 = repo.revision();
        repo.index_file("a.md", "x", 1, 1, vec![]).await.unwrap();
        let r1 = repo.revision();
        assert!(r1 > r0);
        repo.rename_file("a.md", "b.md").await.unwrap();
        let r2 = repo.revision();
        assert!(r2 > r1);
        repo.delete_file("b.md").await.unwrap();
        assert!(repo.revision() > r2);
    }

    #[tokio::test]
    async fn test_search_similar_hydrates_and_orders() {
        let (_dir, repo) = setup().await;
        repo.index_file(
            "a.md",
            "# Alpha\nfox",
            1,
            4,
            vec![chunk(0, "fox text", Some(vec![1.0, 0.0, 0.0]))],
        )
        .await
        .unwrap();
        repo.index_file(
            "b.md",
            "# Beta\ndog",
            1,
            4,
            vec![chunk(0, "dog text", Some(vec![0.0, 1.0, 0.0]))],
        )
        .await
        .unwrap();

        let results = repo.search_similar(&[0.9, 0.1, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, "a.md");
        assert_eq!(results[0].title, "Alpha");
        assert!(results[0].similarity > results[1].similarity);
    }

    struct FailingEngine;

    #[async_trait]
    impl VectorEngine for FailingEngine {
        fn name(&self) -> &'static str {
            "sqlite-vec"
        }
        async fn insert(&self, _: i64, _: &[f32]) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _: &[i64]) -> Result<()> {
            Ok(())
        }
        async fn search(&self, _: &[f32], _: usize) -> Result<Vec<ChunkHit>> {
            Err(NotebitErr::db("vec search", "extension missing"))
        }
    }

    #[tokio::test]
    async fn test_search_falls_back_to_brute_force() {
        let (_dir, repo) = setup().await;
        repo.index_file(
            "a.md",
            "fox",
            1,
            3,
            vec![chunk(0, "fox", Some(vec![1.0, 0.0, 0.0]))],
        )
        .await
        .unwrap();

        repo.install_engine("sqlite-vec", Arc::new(FailingEngine));
        let results = repo.search_similar(&[1.0, 0.0, 0.0], 3).await.unwrap();
        assert_eq!(results.len(), 1);

        let selection = repo.current_vector_engine();
        assert_eq!(selection.requested, "sqlite-vec");
        assert_eq!(selection.effective, "brute-force");
    }

    #[tokio::test]
    async fn test_select_vector_engine() {
        let (_dir, repo) = setup().await;
        let selection = repo.select_vector_engine("brute-force").unwrap();
        assert_eq!(selection.requested, "brute-force");
        assert_eq!(selection.effective, "brute-force");
        assert!(repo.select_vector_engine("hnsw").is_err());
    }

    #[tokio::test]
    async fn test_index_file_wrong_dimension_commits_without_vec() {
        let (_dir, repo) = setup().await;
        // 2-dimensional embedding against a 3-dimensional schema.
        repo.index_file(
            "a.md",
            "x",
            1,
            1,
            vec![chunk(0, "x", Some(vec![1.0, 0.0]))],
        )
        .await
        .unwrap();

        let file = repo.get_file_by_path("a.md").await.unwrap().unwrap();
        let chunks = repo.get_chunks_by_file_id(file.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].vec_indexed);
        assert!(chunks[0].embedding.is_some());
    }

    #[tokio::test]
    async fn test_tags_round_trip() {
        let (_dir, repo) = setup().await;
        repo.index_file("a.md", "x", 1, 1, vec![]).await.unwrap();

        repo.set_file_tags("a.md", &["work".to_string(), "ideas".to_string()])
            .await
            .unwrap();
        assert_eq!(repo.get_file_tags("a.md").await.unwrap(), ["ideas", "work"]);
        assert_eq!(repo.list_tags().await.unwrap(), ["ideas", "work"]);

        repo.set_file_tags("a.md", &["work".to_string()]).await.unwrap();
        assert_eq!(repo.get_file_tags("a.md").await.unwrap(), ["work"]);

        // Deleting the file cascades the association.
        repo.delete_file("a.md").await.unwrap();
        assert!(repo.set_file_tags("a.md", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_first_chunks() {
        let (_dir, repo) = setup().await;
        repo.index_file(
            "a.md",
            "x",
            1,
            1,
            vec![
                chunk(0, "first", Some(vec![1.0, 0.0, 0.0])),
                chunk(1, "second", None),
            ],
        )
        .await
        .unwrap();
        repo.index_file("b.md", "y", 1, 1, vec![chunk(0, "b-first", None)])
            .await
            .unwrap();

        let firsts = repo.first_chunks(10).await.unwrap();
        assert_eq!(firsts.len(), 2);
        assert_eq!(firsts[0].1.content, "first");
        assert_eq!(firsts[1].1.content, "b-first");

        let capped = repo.first_chunks(1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, repo) = setup().await;
        repo.index_file(
            "a.md",
            "x",
            1,
            1,
            vec![
                chunk(0, "embedded", Some(vec![1.0, 0.0, 0.0])),
                chunk(1, "bare", None),
            ],
        )
        .await
        .unwrap();

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.embedded_chunk_count, 1);
        assert_eq!(stats.vec_indexed_count, 1);
        assert!(stats.db_size_bytes > 0);
    }
}
