//! One-shot, resumable vector-index migration.
//!
//! Rewrites chunks that hold embedding blobs but are missing from the vec0
//! index. Progress is recorded per row through the `vec_indexed` flag, so
//! interrupting and re-running is always safe.

use std::sync::Arc;

use rusqlite::params;
use tokio_util::sync::CancellationToken;

use super::sqlite::SqliteStore;
use crate::error::NotebitErr;
use crate::error::Result;

/// Outcome of a migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Rows inserted into the vector index.
    pub migrated: i64,
    /// Rows skipped (dimension mismatch with the schema).
    pub skipped: i64,
}

/// Migrates legacy embedding blobs into the vec0 index in batches.
pub struct VectorMigrator {
    store: Arc<SqliteStore>,
    batch_size: usize,
}

impl VectorMigrator {
    pub fn new(store: Arc<SqliteStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Run until no unmigrated rows remain or the token fires.
    ///
    /// Each batch commits in its own transaction; a cancelled run reports
    /// what it completed and the next run picks up the remainder.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let mut cursor: i64 = 0;
        let batch_size = self.batch_size;
        let dimension = self.store.dimension() as usize;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(
                    migrated = report.migrated,
                    "Vector migration interrupted, will resume on next run"
                );
                return Ok(report);
            }

            let (migrated, skipped, next_cursor) = self
                .store
                .transaction(move |conn| {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, embedding FROM chunks
                             WHERE id > ?1
                               AND embedding IS NOT NULL AND length(embedding) > 0
                               AND vec_indexed = 0
                             ORDER BY id LIMIT ?2",
                        )
                        .map_err(|e| NotebitErr::db("prepare migration batch", e))?;
                    let rows = stmt
                        .query_map(params![cursor, batch_size as i64], |row| {
                            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                        })
                        .map_err(|e| NotebitErr::db("read migration batch", e))?;

                    let mut batch = Vec::new();
                    for row in rows {
                        batch.push(row.map_err(|e| NotebitErr::db("read migration row", e))?);
                    }

                    let mut migrated = 0i64;
                    let mut skipped = 0i64;
                    let mut next_cursor = cursor;
                    for (chunk_id, blob) in batch {
                        next_cursor = chunk_id;
                        if blob.len() != dimension * 4 {
                            tracing::debug!(
                                chunk_id = chunk_id,
                                blob_len = blob.len(),
                                "skipping legacy blob with mismatched dimension"
                            );
                            skipped += 1;
                            continue;
                        }
                        conn.execute(
                            "INSERT OR REPLACE INTO vec_chunks (chunk_id, embedding)
                             VALUES (?1, ?2)",
                            params![chunk_id, blob],
                        )
                        .map_err(|e| NotebitErr::db("migrate vector", e))?;
                        conn.execute(
                            "UPDATE chunks SET vec_indexed = 1 WHERE id = ?1",
                            params![chunk_id],
                        )
                        .map_err(|e| NotebitErr::db("mark migrated", e))?;
                        migrated += 1;
                    }
                    Ok((migrated, skipped, next_cursor))
                })
                .await?;

            report.migrated += migrated;
            report.skipped += skipped;

            if next_cursor == cursor {
                break;
            }
            cursor = next_cursor;
        }

        if report.migrated > 0 || report.skipped > 0 {
            tracing::info!(
                migrated = report.migrated,
                skipped = report.skipped,
                "Vector migration complete"
            );
        }
        Ok(report)
    }

    /// Null out legacy blobs once every embedded chunk is in the vec index.
    ///
    /// Only meaningful when the accelerated engine is the persisted choice;
    /// the brute-force engine reads the blobs. Returns whether cleanup ran.
    pub async fn cleanup_legacy_blobs(&self) -> Result<bool> {
        self.store
            .transaction(|conn| {
                let pending: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM chunks
                         WHERE embedding IS NOT NULL AND length(embedding) > 0
                           AND vec_indexed = 0",
                        [],
                        |r| r.get(0),
                    )
                    .map_err(|e| NotebitErr::db("count pending migration", e))?;
                if pending > 0 {
                    return Ok(false);
                }
                conn.execute("UPDATE chunks SET embedding = NULL WHERE vec_indexed = 1", [])
                    .map_err(|e| NotebitErr::db("cleanup legacy blobs", e))?;
                Ok(true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::vector_to_blob;
    use tempfile::TempDir;

    const DIM: i32 = 3;

    async fn setup() -> (TempDir, Arc<SqliteStore>) {
        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(SqliteStore::open(&dir.path().join("notebit.sqlite"), DIM).unwrap());
        (dir, store)
    }

    /// Insert a chunk row carrying a blob but not present in the vec index.
    async fn insert_legacy_chunk(store: &Arc<SqliteStore>, path: &str, vector: Vec<f32>) -> i64 {
        let path = path.to_string();
        let blob = vector_to_blob(&vector);
        store
            .transaction(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO files (path, title, content_hash, mtime, size, created_at, updated_at)
                     VALUES (?1, ?1, 'h', 0, 0, 0, 0)",
                    params![path],
                )?;
                let file_id: i64 = conn.query_row(
                    "SELECT id FROM files WHERE path = ?1",
                    params![path],
                    |r| r.get(0),
                )?;
                conn.execute(
                    "INSERT INTO chunks (file_id, position, content, embedding, embedding_model, vec_indexed)
                     VALUES (?1, 0, 'legacy', ?2, 'test', 0)",
                    params![file_id, blob],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .unwrap()
    }

    async fn vec_count(store: &Arc<SqliteStore>) -> i64 {
        store
            .query(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM vec_chunks", [], |r| r.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrates_legacy_blobs() {
        let (_dir, store) = setup().await;
        for i in 0..7 {
            insert_legacy_chunk(&store, &format!("{i}.md"), vec![i as f32, 0.0, 1.0]).await;
        }

        let migrator = VectorMigrator::new(store.clone(), 3);
        let report = migrator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.migrated, 7);
        assert_eq!(report.skipped, 0);
        assert_eq!(vec_count(&store).await, 7);

        let unmigrated: i64 = store
            .query(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE vec_indexed = 0",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(unmigrated, 0);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (_dir, store) = setup().await;
        insert_legacy_chunk(&store, "a.md", vec![1.0, 0.0, 0.0]).await;

        let migrator = VectorMigrator::new(store.clone(), 500);
        let first = migrator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.migrated, 1);
        let second = migrator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.migrated, 0);
    }

    #[tokio::test]
    async fn test_skips_mismatched_dimension() {
        let (_dir, store) = setup().await;
        insert_legacy_chunk(&store, "good.md", vec![1.0, 0.0, 0.0]).await;
        insert_legacy_chunk(&store, "bad.md", vec![1.0, 0.0]).await;

        let migrator = VectorMigrator::new(store.clone(), 500);
        let report = migrator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(vec_count(&store).await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_resumes() {
        let (_dir, store) = setup().await;
        insert_legacy_chunk(&store, "a.md", vec![1.0, 0.0, 0.0]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let migrator = VectorMigrator::new(store.clone(), 500);
        let report = migrator.run(&cancel).await.unwrap();
        assert_eq!(report.migrated, 0);

        // Fresh token picks up the remainder.
        let report = migrator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.migrated, 1);
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_full_migration() {
        let (_dir, store) = setup().await;
        insert_legacy_chunk(&store, "a.md", vec![1.0, 0.0, 0.0]).await;

        let migrator = VectorMigrator::new(store.clone(), 500);
        assert!(!migrator.cleanup_legacy_blobs().await.unwrap());

        migrator.run(&CancellationToken::new()).await.unwrap();
        assert!(migrator.cleanup_legacy_blobs().await.unwrap());

        let blobs: i64 = store
            .query(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(blobs, 0);
    }
}
