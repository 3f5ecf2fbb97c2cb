//! The indexing pipeline: one queue, one worker pool.
//!
//! Every index-causing event (explicit save, watcher event, full rescan)
//! goes through here. Per job, either the index ends consistent with the
//! new content or it is left unchanged; transient AI failures degrade to
//! chunk-only and then metadata-only indexing instead of surfacing to the
//! save path.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::queue::IndexJob;
use super::queue::IndexOptions;
use super::queue::IndexQueue;
use super::queue::JobKind;
use crate::ai::AiService;
use crate::config::IndexingConfig;
use crate::error::Result;
use crate::storage::NoteRepository;
use crate::vault;

/// Delay before retrying a job whose path is being processed by another
/// worker.
const REQUEUE_DELAY: Duration = Duration::from_millis(10);

/// Snapshot of full-rescan progress.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: i64,
    pub done: i64,
    pub failed: i64,
}

#[derive(Debug, Default)]
struct ScanProgress {
    total: AtomicI64,
    done: AtomicI64,
    failed: AtomicI64,
}

impl ScanProgress {
    fn reset(&self) {
        self.total.store(0, Ordering::Release);
        self.done.store(0, Ordering::Release);
        self.failed.store(0, Ordering::Release);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Acquire),
            done: self.done.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

/// The process-wide indexing pipeline.
pub struct IndexPipeline {
    queue: Arc<IndexQueue>,
    repository: Arc<NoteRepository>,
    ai: Arc<AiService>,
    cancel: CancellationToken,
    worker_count: usize,
    shutdown_grace: Duration,
    /// Paths currently being processed; guarantees serial per-path work.
    processing: Mutex<HashSet<String>>,
    /// Jobs currently inside a worker.
    active: AtomicI64,
    workers_started: AtomicBool,
    progress: ScanProgress,
}

impl IndexPipeline {
    pub fn new(
        repository: Arc<NoteRepository>,
        ai: Arc<AiService>,
        config: &IndexingConfig,
    ) -> Self {
        Self {
            queue: Arc::new(IndexQueue::new(config.queue_size.max(1) as usize)),
            repository,
            ai,
            cancel: CancellationToken::new(),
            worker_count: config.worker_count.max(1) as usize,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs.max(0) as u64),
            processing: Mutex::new(HashSet::new()),
            active: AtomicI64::new(0),
            workers_started: AtomicBool::new(false),
            progress: ScanProgress::default(),
        }
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start_workers(self: &Arc<Self>) {
        if self.workers_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(workers = self.worker_count, "Starting indexing workers");
        for id in 0..self.worker_count {
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                pipeline.worker_loop(id).await;
            });
        }
    }

    /// Drain current work up to the grace period, then cancel outstanding
    /// jobs.
    pub async fn stop(&self) {
        let _ = tokio::time::timeout(self.shutdown_grace, self.wait_idle()).await;
        self.cancel.cancel();
        tracing::info!("Indexing pipeline stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue length plus jobs inside workers.
    pub fn pending(&self) -> usize {
        self.queue.len() + self.active.load(Ordering::Acquire).max(0) as usize
    }

    /// Rescan progress for UI reporting.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Enqueue a save; blocks only when the queue is full.
    pub async fn enqueue_save(
        &self,
        path: &str,
        content: String,
        mtime: i64,
        size: i64,
        options: IndexOptions,
    ) {
        self.queue
            .enqueue(path, IndexJob::upsert(content, mtime, size).with_options(options))
            .await;
    }

    /// Enqueue an index removal.
    pub async fn enqueue_remove(&self, path: &str) {
        self.queue.enqueue(path, IndexJob::remove()).await;
    }

    /// Non-blocking enqueue for the watcher; the caller drops the event
    /// when the queue is full.
    pub fn try_enqueue(&self, path: &str, job: IndexJob) -> Result<()> {
        self.queue.try_enqueue(path, job)
    }

    /// Wait until the queue is empty and no worker holds a job.
    pub async fn wait_idle(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.queue.is_empty() && self.active.load(Ordering::Acquire) == 0 {
                // Settle once more; a worker may be between pop and active.
                tokio::time::sleep(Duration::from_millis(20)).await;
                if self.queue.is_empty() && self.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                continue;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Full rescan: prune index rows whose files vanished, then enqueue
    /// every stale note. Progress is readable via [`IndexPipeline::progress`].
    pub async fn reindex_all(&self, vault_root: &Path, force: bool) -> Result<()> {
        let root = vault_root.to_path_buf();
        let notes = tokio::task::spawn_blocking(move || vault::scan_notes(&root))
            .await
            .unwrap_or_default();

        self.progress.reset();

        // Files deleted outside the watcher's observation window leave
        // stale rows behind; remove them before re-enqueueing.
        let on_disk: HashSet<&str> = notes.iter().map(|(rel, _)| rel.as_str()).collect();
        for file in self.repository.list_files().await? {
            if !on_disk.contains(file.path.as_str()) {
                tracing::info!(path = %file.path, "pruning vanished file from index");
                let _ = self.repository.delete_file(&file.path).await;
            }
        }

        for (rel, abs) in notes {
            if self.cancel.is_cancelled() {
                break;
            }
            let content = match tokio::fs::read_to_string(&abs).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "failed to read note during rescan");
                    self.progress.total.fetch_add(1, Ordering::AcqRel);
                    self.progress.failed.fetch_add(1, Ordering::AcqRel);
                    continue;
                }
            };
            if !force && !self.repository.file_needs_indexing(&rel, &content).await? {
                continue;
            }
            let meta = tokio::fs::metadata(&abs).await.ok();
            let mtime = meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let size = meta.map(|m| m.len() as i64).unwrap_or(content.len() as i64);

            self.progress.total.fetch_add(1, Ordering::AcqRel);
            let mut job = IndexJob::upsert(content, mtime, size).with_options(IndexOptions {
                force_reindex: force,
                metadata_only: false,
            });
            job.record_progress = true;
            self.queue.enqueue(&rel, job).await;
        }

        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id = worker_id, "indexing worker started");
        let mut rx = self.queue.subscribe();

        // Catch up on anything enqueued before we subscribed.
        self.process_available(worker_id).await;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break;
                }

                result = rx.recv() => {
                    match result {
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            self.process_available(worker_id).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }

                // Fallback poll in case a notification was missed.
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    self.process_available(worker_id).await;
                }
            }
        }
        tracing::debug!(worker_id = worker_id, "indexing worker stopped");
    }

    async fn process_available(&self, worker_id: usize) {
        while !self.cancel.is_cancelled() {
            let Some((path, job)) = self.queue.pop() else {
                break;
            };

            // Serial per-path processing: a path already inside a worker
            // goes back to the queue and coalesces with later events.
            let acquired = self
                .processing
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(path.clone());
            if !acquired {
                self.queue.enqueue(&path, job).await;
                tokio::time::sleep(REQUEUE_DELAY).await;
                continue;
            }

            self.active.fetch_add(1, Ordering::AcqRel);
            let result = self.process_job(&path, &job).await;
            match &result {
                Ok(()) => {
                    tracing::debug!(worker_id = worker_id, path = %path, "job processed");
                }
                Err(e) => {
                    tracing::warn!(worker_id = worker_id, path = %path, error = %e, "job failed");
                }
            }
            if job.record_progress {
                match result {
                    Ok(()) => self.progress.done.fetch_add(1, Ordering::AcqRel),
                    Err(_) => self.progress.failed.fetch_add(1, Ordering::AcqRel),
                };
            }

            self.processing
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&path);
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Per-job procedure: skip test, full processing, chunk-only fallback,
    /// metadata-only last resort.
    async fn process_job(&self, path: &str, job: &IndexJob) -> Result<()> {
        match &job.kind {
            JobKind::Remove => {
                self.repository.delete_file(path).await?;
                Ok(())
            }
            JobKind::Upsert {
                content,
                mtime,
                size,
            } => {
                if job.options.metadata_only {
                    self.repository
                        .index_file(path, content, *mtime, *size, Vec::new())
                        .await?;
                    return Ok(());
                }

                if !job.options.force_reindex
                    && !self.repository.file_needs_indexing(path, content).await?
                {
                    tracing::trace!(path = %path, "index up to date, skipping");
                    return Ok(());
                }

                let chunks = match self.ai.process_document(content).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        tracing::warn!(
                            path = %path,
                            error = %e,
                            "embedding failed, indexing chunks without vectors"
                        );
                        let chunks = self.ai.chunk_document(content);
                        if chunks.is_empty() && !content.trim().is_empty() {
                            tracing::warn!(path = %path, "chunking produced nothing, metadata-only");
                        }
                        chunks
                    }
                };

                self.repository
                    .index_file(path, content, *mtime, *size, chunks)
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::test_service;
    use crate::ai::testing::HashEmbedder;
    use crate::ai::testing::TEST_DIMENSION;
    use crate::storage::SqliteStore;
    use crate::types::content_hash;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        pipeline: Arc<IndexPipeline>,
        repository: Arc<NoteRepository>,
        ai: Arc<AiService>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open(&dir.path().join("data/notebit.sqlite"), TEST_DIMENSION as i32)
                .unwrap(),
        );
        let repository = Arc::new(NoteRepository::new(store, "sqlite-vec").unwrap());
        let ai = Arc::new(test_service("answer"));
        let pipeline = Arc::new(IndexPipeline::new(
            repository.clone(),
            ai.clone(),
            &IndexingConfig::default(),
        ));
        pipeline.start_workers();
        Fixture {
            _dir: dir,
            pipeline,
            repository,
            ai,
        }
    }

    #[tokio::test]
    async fn test_save_then_search() {
        let fx = fixture().await;
        fx.pipeline
            .enqueue_save(
                "a.md",
                "# Alpha\n\nThe quick brown fox".to_string(),
                1,
                25,
                IndexOptions::default(),
            )
            .await;
        fx.pipeline.wait_idle().await;

        let file = fx.repository.get_file_by_path("a.md").await.unwrap().unwrap();
        assert_eq!(file.title, "Alpha");
        let chunks = fx.repository.get_chunks_by_file_id(file.id).await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.embedding.is_some() && c.vec_indexed));

        let query = fx.ai.embed_query("fox").await.unwrap();
        let results = fx.repository.search_similar(&query, 3).await.unwrap();
        assert!(results.iter().any(|r| r.path == "a.md" && r.similarity > 0.3));
    }

    #[tokio::test]
    async fn test_unchanged_content_skips_rewrite() {
        let fx = fixture().await;
        let body = "# A\n\nstable content".to_string();
        fx.pipeline
            .enqueue_save("a.md", body.clone(), 1, 10, IndexOptions::default())
            .await;
        fx.pipeline.wait_idle().await;
        let revision = fx.repository.revision();

        fx.pipeline
            .enqueue_save("a.md", body, 2, 10, IndexOptions::default())
            .await;
        fx.pipeline.wait_idle().await;
        assert_eq!(fx.repository.revision(), revision);
    }

    #[tokio::test]
    async fn test_force_reindex_bypasses_skip() {
        let fx = fixture().await;
        let body = "# A\n\ncontent".to_string();
        fx.pipeline
            .enqueue_save("a.md", body.clone(), 1, 10, IndexOptions::default())
            .await;
        fx.pipeline.wait_idle().await;
        let revision = fx.repository.revision();

        fx.pipeline
            .enqueue_save(
                "a.md",
                body,
                2,
                10,
                IndexOptions {
                    force_reindex: true,
                    metadata_only: false,
                },
            )
            .await;
        fx.pipeline.wait_idle().await;
        assert!(fx.repository.revision() > revision);
    }

    #[tokio::test]
    async fn test_rapid_saves_coalesce() {
        let fx = fixture().await;
        let revision_before = fx.repository.revision();

        for i in 0..10 {
            fx.pipeline
                .enqueue_save(
                    "c.md",
                    format!("# C\n\nbody revision {i}"),
                    i,
                    20,
                    IndexOptions::default(),
                )
                .await;
        }
        fx.pipeline.wait_idle().await;

        let file = fx.repository.get_file_by_path("c.md").await.unwrap().unwrap();
        assert_eq!(file.content_hash, content_hash("# C\n\nbody revision 9"));
        // At most initial + one coalesced write.
        let writes = fx.repository.revision() - revision_before;
        assert!(writes >= 1 && writes <= 2, "writes = {writes}");
    }

    #[tokio::test]
    async fn test_offline_falls_back_to_chunk_only() {
        let fx = fixture().await;
        fx.ai.set_embedding_provider(None);

        fx.pipeline
            .enqueue_save(
                "b.md",
                "# Beta\n\ncontent".to_string(),
                1,
                10,
                IndexOptions::default(),
            )
            .await;
        fx.pipeline.wait_idle().await;

        let file = fx.repository.get_file_by_path("b.md").await.unwrap().unwrap();
        let chunks = fx.repository.get_chunks_by_file_id(file.id).await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.embedding.is_none()));

        // Provider comes back; the skip test notices the missing
        // embeddings and a plain re-enqueue repairs them.
        fx.ai.set_embedding_provider(Some(Arc::new(HashEmbedder)));
        assert!(fx
            .repository
            .file_needs_indexing("b.md", "# Beta\n\ncontent")
            .await
            .unwrap());
        fx.pipeline
            .enqueue_save(
                "b.md",
                "# Beta\n\ncontent".to_string(),
                2,
                10,
                IndexOptions::default(),
            )
            .await;
        fx.pipeline.wait_idle().await;

        let chunks = fx.repository.get_chunks_by_file_id(file.id).await.unwrap();
        assert!(chunks.iter().all(|c| c.embedding.is_some()));
    }

    #[tokio::test]
    async fn test_metadata_only() {
        let fx = fixture().await;
        fx.pipeline
            .enqueue_save(
                "m.md",
                "# M\n\nbody".to_string(),
                1,
                8,
                IndexOptions {
                    force_reindex: false,
                    metadata_only: true,
                },
            )
            .await;
        fx.pipeline.wait_idle().await;

        let file = fx.repository.get_file_by_path("m.md").await.unwrap().unwrap();
        let chunks = fx.repository.get_chunks_by_file_id(file.id).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_remove_job() {
        let fx = fixture().await;
        fx.pipeline
            .enqueue_save("a.md", "# A".to_string(), 1, 3, IndexOptions::default())
            .await;
        fx.pipeline.wait_idle().await;
        assert!(fx.repository.get_file_by_path("a.md").await.unwrap().is_some());

        fx.pipeline.enqueue_remove("a.md").await;
        fx.pipeline.wait_idle().await;
        assert!(fx.repository.get_file_by_path("a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reindex_all_with_progress_and_pruning() {
        let fx = fixture().await;
        let vault_dir = TempDir::new().unwrap();
        std::fs::write(vault_dir.path().join("x.md"), "# X\n\nfirst note").unwrap();
        std::fs::write(vault_dir.path().join("y.md"), "# Y\n\nsecond note").unwrap();

        // A row for a file that no longer exists on disk.
        fx.repository
            .index_file("ghost.md", "gone", 0, 4, Vec::new())
            .await
            .unwrap();

        fx.pipeline.reindex_all(vault_dir.path(), false).await.unwrap();
        fx.pipeline.wait_idle().await;

        let progress = fx.pipeline.progress();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.done, 2);
        assert_eq!(progress.failed, 0);

        assert!(fx.repository.get_file_by_path("ghost.md").await.unwrap().is_none());
        assert!(fx.repository.get_file_by_path("x.md").await.unwrap().is_some());
        assert!(fx.repository.get_file_by_path("y.md").await.unwrap().is_some());

        // Second rescan finds nothing stale.
        fx.pipeline.reindex_all(vault_dir.path(), false).await.unwrap();
        fx.pipeline.wait_idle().await;
        assert_eq!(fx.pipeline.progress().total, 0);
    }

    #[tokio::test]
    async fn test_stop_drains() {
        let fx = fixture().await;
        fx.pipeline
            .enqueue_save("a.md", "# A".to_string(), 1, 3, IndexOptions::default())
            .await;
        fx.pipeline.stop().await;
        assert!(fx.pipeline.is_stopped());
        assert!(fx.repository.get_file_by_path("a.md").await.unwrap().is_some());
    }
}
