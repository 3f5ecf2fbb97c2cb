//! Filesystem watcher bridging native events into the indexing pipeline.
//!
//! Raw notify events are classified into logical per-path events and
//! debounced: repeated events for one path inside the window collapse to
//! one, a delete followed by a create becomes a modify, and renames are
//! applied as a path rewrite plus a reindex of the new path.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::event::RenameMode;
use notify::EventKind;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::NotebitErr;
use crate::error::Result;
use crate::indexing::IndexJob;
use crate::indexing::IndexPipeline;
use crate::storage::NoteRepository;
use crate::vault;

/// Logical, debounced event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    Modified,
    Deleted,
}

/// Merge a newer event into a pending one for the same path.
///
/// Deleted always wins over earlier events; a delete followed by a create
/// inside the window is a modify; a create followed by a modify stays a
/// create.
pub fn merge_kinds(pending: WatchKind, newer: WatchKind) -> WatchKind {
    match (pending, newer) {
        (_, WatchKind::Deleted) => WatchKind::Deleted,
        (WatchKind::Deleted, WatchKind::Created) => WatchKind::Modified,
        (WatchKind::Deleted, other) => other,
        (WatchKind::Created, WatchKind::Modified) => WatchKind::Created,
        (_, newer) => newer,
    }
}

/// Classify a raw notify event kind; `None` for noise (access etc.).
fn classify_kind(kind: &EventKind) -> Option<WatchKind> {
    match kind {
        EventKind::Create(_) => Some(WatchKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => None, // handled as rename
        EventKind::Modify(_) => Some(WatchKind::Modified),
        EventKind::Remove(_) => Some(WatchKind::Deleted),
        _ => None,
    }
}

/// Vault-relative indexable path for an absolute event path.
fn indexable_rel(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    if !vault::is_indexable(rel) {
        return None;
    }
    Some(vault::normalize_rel(rel))
}

struct Running {
    root: PathBuf,
    _watcher: notify::RecommendedWatcher,
    cancel: CancellationToken,
}

/// Debounced vault watcher feeding the indexing pipeline.
pub struct VaultWatcher {
    pipeline: Arc<IndexPipeline>,
    repository: Arc<NoteRepository>,
    debounce: Duration,
    grace: Duration,
    running: Mutex<Option<Running>>,
}

impl VaultWatcher {
    pub fn new(
        pipeline: Arc<IndexPipeline>,
        repository: Arc<NoteRepository>,
        debounce_ms: u64,
        grace_secs: u64,
    ) -> Self {
        Self {
            pipeline,
            repository,
            debounce: Duration::from_millis(debounce_ms.max(1)),
            grace: Duration::from_secs(grace_secs),
            running: Mutex::new(None),
        }
    }

    /// Start watching a vault root. Idempotent: calling again for the same
    /// root is a no-op; a different root restarts the watcher.
    pub async fn start(&self, vault_root: &Path) -> Result<()> {
        {
            let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(running) = running.as_ref() {
                if running.root == vault_root {
                    return Ok(());
                }
            }
        }
        self.stop().await;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = raw_tx.send(event);
        })
        .map_err(|e| NotebitErr::Watcher {
            cause: e.to_string(),
        })?;
        watcher
            .watch(vault_root, RecursiveMode::Recursive)
            .map_err(|e| NotebitErr::Watcher {
                cause: e.to_string(),
            })?;

        let cancel = CancellationToken::new();
        tokio::spawn(debounce_loop(
            vault_root.to_path_buf(),
            raw_rx,
            self.pipeline.clone(),
            self.repository.clone(),
            self.debounce,
            cancel.clone(),
        ));

        // Bootstrap: enqueue every stale note, concurrently with live
        // events; queue dedup keeps this correct.
        let pipeline = self.pipeline.clone();
        let root = vault_root.to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = pipeline.reindex_all(&root, false).await {
                tracing::warn!(error = %e, "bootstrap scan failed");
            }
        });

        *self.running.lock().unwrap_or_else(|p| p.into_inner()) = Some(Running {
            root: vault_root.to_path_buf(),
            _watcher: watcher,
            cancel,
        });
        tracing::info!(root = %vault_root.display(), "vault watcher started");
        Ok(())
    }

    /// Stop watching. Drains in-flight indexing up to the grace period.
    /// Safe to call repeatedly; `start` may be called again afterwards.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        drop(running._watcher);
        let _ = tokio::time::timeout(self.grace, self.pipeline.wait_idle()).await;
        tracing::info!("vault watcher stopped");
    }

    /// Whether the watcher is currently running.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }
}

/// Per-path debouncer: collects classified events and fires each path once
/// its window elapses.
async fn debounce_loop(
    root: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    pipeline: Arc<IndexPipeline>,
    repository: Arc<NoteRepository>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    let mut pending: HashMap<String, (WatchKind, Instant)> = HashMap::new();

    loop {
        let now = Instant::now();
        let next_deadline = pending.values().map(|(_, d)| *d).min();
        let timer_deadline =
            next_deadline.unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24));
        let timer = sleep_until(timer_deadline);
        tokio::pin!(timer);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // Flush whatever is still pending before shutting down.
                for (rel, (kind, _)) in pending.drain() {
                    fire_event(&root, &rel, kind, &pipeline).await;
                }
                break;
            }

            event = raw_rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        handle_raw_event(
                            &root,
                            event,
                            &mut pending,
                            debounce,
                            &pipeline,
                            &repository,
                        )
                        .await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "watcher error");
                    }
                    None => {
                        for (rel, (kind, _)) in pending.drain() {
                            fire_event(&root, &rel, kind, &pipeline).await;
                        }
                        break;
                    }
                }
            }

            _ = &mut timer => {
                let now = Instant::now();
                let due: Vec<String> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(rel, _)| rel.clone())
                    .collect();
                for rel in due {
                    if let Some((kind, _)) = pending.remove(&rel) {
                        fire_event(&root, &rel, kind, &pipeline).await;
                    }
                }
            }
        }
    }
}

async fn handle_raw_event(
    root: &Path,
    event: notify::Event,
    pending: &mut HashMap<String, (WatchKind, Instant)>,
    debounce: Duration,
    pipeline: &Arc<IndexPipeline>,
    repository: &Arc<NoteRepository>,
) {
    // Renames bypass the debouncer: the path rewrite must land before any
    // queued reindex of the new path.
    if matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both))
    ) && event.paths.len() == 2
    {
        let old = indexable_rel(root, &event.paths[0]);
        let new = indexable_rel(root, &event.paths[1]);
        match (old, new) {
            (Some(old), Some(new)) => {
                pending.remove(&old);
                match repository.rename_file(&old, &new).await {
                    Ok(()) => {
                        tracing::debug!(old = %old, new = %new, "rename applied");
                    }
                    Err(e) => {
                        tracing::debug!(old = %old, new = %new, error = %e, "rename fell back to create");
                    }
                }
                fire_event(root, &new, WatchKind::Modified, pipeline).await;
            }
            (Some(old), None) => {
                pending.remove(&old);
                fire_event(root, &old, WatchKind::Deleted, pipeline).await;
            }
            (None, Some(new)) => {
                fire_event(root, &new, WatchKind::Created, pipeline).await;
            }
            (None, None) => {}
        }
        return;
    }

    // Reads are noise; partial rename notifications degrade to
    // create/delete by existence.
    let kind = match &event.kind {
        EventKind::Access(_) => return,
        EventKind::Modify(ModifyKind::Name(_)) => None,
        other => classify_kind(other),
    };

    for abs in &event.paths {
        let Some(rel) = indexable_rel(root, abs) else {
            continue;
        };
        let kind = match kind {
            Some(kind) => kind,
            None => {
                if abs.exists() {
                    WatchKind::Created
                } else {
                    WatchKind::Deleted
                }
            }
        };
        let deadline = Instant::now() + debounce;
        pending
            .entry(rel)
            .and_modify(|(pending_kind, pending_deadline)| {
                *pending_kind = merge_kinds(*pending_kind, kind);
                *pending_deadline = deadline;
            })
            .or_insert((kind, deadline));
    }
}

/// Apply one debounced event to the pipeline. A full queue drops the
/// event with a log line; the next scan repairs anything missed.
async fn fire_event(root: &Path, rel: &str, kind: WatchKind, pipeline: &Arc<IndexPipeline>) {
    let job = match kind {
        WatchKind::Deleted => IndexJob::remove(),
        WatchKind::Created | WatchKind::Modified => {
            let abs = root.join(rel);
            match tokio::fs::read_to_string(&abs).await {
                Ok(content) => {
                    let meta = tokio::fs::metadata(&abs).await.ok();
                    let mtime = meta
                        .as_ref()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    let size = meta.map(|m| m.len() as i64).unwrap_or(0);
                    IndexJob::upsert(content, mtime, size)
                }
                // Vanished between event and read.
                Err(_) => IndexJob::remove(),
            }
        }
    };

    if let Err(e) = pipeline.try_enqueue(rel, job) {
        tracing::warn!(path = %rel, error = %e, "indexing queue full, dropping watcher event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::test_service;
    use crate::ai::testing::TEST_DIMENSION;
    use crate::config::IndexingConfig;
    use crate::storage::SqliteStore;
    use tempfile::TempDir;

    #[test]
    fn test_merge_rules() {
        use WatchKind::*;
        assert_eq!(merge_kinds(Created, Deleted), Deleted);
        assert_eq!(merge_kinds(Modified, Deleted), Deleted);
        // Delete then create inside the window is a modify.
        assert_eq!(merge_kinds(Deleted, Created), Modified);
        assert_eq!(merge_kinds(Created, Modified), Created);
        assert_eq!(merge_kinds(Modified, Created), Created);
        assert_eq!(merge_kinds(Modified, Modified), Modified);
    }

    #[test]
    fn test_classify_kind() {
        assert_eq!(
            classify_kind(&EventKind::Create(notify::event::CreateKind::File)),
            Some(WatchKind::Created)
        );
        assert_eq!(
            classify_kind(&EventKind::Remove(notify::event::RemoveKind::File)),
            Some(WatchKind::Deleted)
        );
        assert_eq!(
            classify_kind(&EventKind::Access(notify::event::AccessKind::Read)),
            None
        );
    }

    #[test]
    fn test_indexable_rel_filters() {
        let root = Path::new("/vault");
        assert_eq!(
            indexable_rel(root, Path::new("/vault/notes/a.md")),
            Some("notes/a.md".to_string())
        );
        assert_eq!(indexable_rel(root, Path::new("/vault/a.txt")), None);
        assert_eq!(indexable_rel(root, Path::new("/vault/.git/a.md")), None);
        assert_eq!(indexable_rel(root, Path::new("/vault/data/a.md")), None);
        assert_eq!(indexable_rel(root, Path::new("/vault/a.md~")), None);
        assert_eq!(indexable_rel(root, Path::new("/elsewhere/a.md")), None);
    }

    struct Fixture {
        vault_dir: TempDir,
        watcher: VaultWatcher,
        repository: Arc<NoteRepository>,
        pipeline: Arc<IndexPipeline>,
    }

    async fn fixture() -> Fixture {
        let vault_dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open(
                &vault_dir.path().join("data/notebit.sqlite"),
                TEST_DIMENSION as i32,
            )
            .unwrap(),
        );
        let repository = Arc::new(NoteRepository::new(store, "sqlite-vec").unwrap());
        let ai = Arc::new(test_service("ok"));
        let pipeline = Arc::new(IndexPipeline::new(
            repository.clone(),
            ai,
            &IndexingConfig::default(),
        ));
        pipeline.start_workers();
        let watcher = VaultWatcher::new(pipeline.clone(), repository.clone(), 100, 5);
        Fixture {
            vault_dir,
            watcher,
            repository,
            pipeline,
        }
    }

    /// Poll until the predicate holds or the timeout elapses.
    async fn eventually<F, Fut>(what: &str, mut f: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if f().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition never held: {what}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_create_modify_delete() {
        let fx = fixture().await;
        fx.watcher.start(fx.vault_dir.path()).await.unwrap();

        std::fs::write(fx.vault_dir.path().join("w.md"), "# W\n\nwatched").unwrap();
        let repository = fx.repository.clone();
        eventually("file indexed after create", || {
            let repository = repository.clone();
            async move {
                repository
                    .get_file_by_path("w.md")
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;

        std::fs::write(fx.vault_dir.path().join("w.md"), "# W\n\nchanged body").unwrap();
        let repository = fx.repository.clone();
        let expected = crate::types::content_hash("# W\n\nchanged body");
        eventually("file reindexed after modify", || {
            let repository = repository.clone();
            let expected = expected.clone();
            async move {
                repository
                    .get_file_by_path("w.md")
                    .await
                    .unwrap()
                    .is_some_and(|f| f.content_hash == expected)
            }
        })
        .await;

        std::fs::remove_file(fx.vault_dir.path().join("w.md")).unwrap();
        let repository = fx.repository.clone();
        eventually("file removed after delete", || {
            let repository = repository.clone();
            async move {
                repository
                    .get_file_by_path("w.md")
                    .await
                    .unwrap()
                    .is_none()
            }
        })
        .await;

        fx.watcher.stop().await;
        assert!(!fx.watcher.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_is_idempotent_and_restartable() {
        let fx = fixture().await;
        fx.watcher.start(fx.vault_dir.path()).await.unwrap();
        fx.watcher.start(fx.vault_dir.path()).await.unwrap();
        assert!(fx.watcher.is_running());

        fx.watcher.stop().await;
        fx.watcher.stop().await;
        assert!(!fx.watcher.is_running());

        fx.watcher.start(fx.vault_dir.path()).await.unwrap();
        assert!(fx.watcher.is_running());
        fx.watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bootstrap_scan_indexes_existing_notes() {
        let fx = fixture().await;
        std::fs::write(fx.vault_dir.path().join("pre.md"), "# Pre\n\nexisting").unwrap();

        fx.watcher.start(fx.vault_dir.path()).await.unwrap();
        let repository = fx.repository.clone();
        eventually("pre-existing note indexed", || {
            let repository = repository.clone();
            async move {
                repository
                    .get_file_by_path("pre.md")
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;

        fx.pipeline.wait_idle().await;
        fx.watcher.stop().await;
    }
}
