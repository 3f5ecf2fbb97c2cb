//! Coordinator: wires the subsystems and exposes the host-facing surface.
//!
//! Wiring order is configuration, repository and vector engine, AI
//! providers, indexing pipeline, watcher, RAG engine, graph builder.
//! Vault switches are serialized behind a process-wide guard; no caller
//! retains handles across a switch.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::ai::AiService;
use crate::ai::AiStatus;
use crate::config::vault_db_path;
use crate::config::AiConfig;
use crate::config::AppConfig;
use crate::config::ChunkingConfig;
use crate::config::GraphConfig;
use crate::config::LlmConfig;
use crate::config::OllamaConfig;
use crate::config::OpenAiConfig;
use crate::config::RagConfig;
use crate::error::NotebitErr;
use crate::error::Result;
use crate::graph::GraphBuilder;
use crate::graph::GraphData;
use crate::indexing::IndexOptions;
use crate::indexing::IndexPipeline;
use crate::indexing::ProgressSnapshot;
use crate::rag::RagEngine;
use crate::rag::RagEvent;
use crate::rag::RagResponse;
use crate::rag::RagStatus;
use crate::storage::repository::EngineSelection;
use crate::storage::NoteRepository;
use crate::storage::SqliteStore;
use crate::storage::VectorMigrator;
use crate::types::DatabaseStats;
use crate::types::NoteFile;
use crate::types::SimilarNote;
use crate::vault::VaultFiles;
use crate::watcher::VaultWatcher;

/// Semantic-search availability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityStatus {
    pub available: bool,
    pub total_chunks: i64,
    pub indexed_chunks: i64,
}

/// Everything bound to one open vault.
pub struct VaultState {
    root: PathBuf,
    vault: VaultFiles,
    config: StdRwLock<AppConfig>,
    repository: Arc<NoteRepository>,
    ai: Arc<AiService>,
    pipeline: Arc<IndexPipeline>,
    watcher: Arc<VaultWatcher>,
    rag: Arc<RagEngine>,
    graph: Arc<GraphBuilder>,
    migrator_cancel: CancellationToken,
}

/// The host-facing service.
pub struct NotebitService {
    state: RwLock<Option<Arc<VaultState>>>,
    /// Serializes open/close transitions.
    switch_guard: Mutex<()>,
}

impl Default for NotebitService {
    fn default() -> Self {
        Self::new()
    }
}

impl NotebitService {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            switch_guard: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Vault lifecycle
    // ------------------------------------------------------------------

    /// Open a vault, closing any previously open one first.
    pub async fn open_vault(&self, path: &Path) -> Result<()> {
        let _guard = self.switch_guard.lock().await;

        if !path.is_dir() {
            return Err(NotebitErr::VaultIo {
                path: path.to_path_buf(),
                cause: "not a directory".to_string(),
            });
        }

        // Supervised transition: stop the old vault's background work
        // before the new repository takes over.
        if let Some(old) = self.state.write().await.take() {
            old.shutdown().await;
        }

        let config = AppConfig::load(path)?;
        config.validate()?;

        let ai = Arc::new(AiService::from_config(&config.ai, &config.chunking)?);
        let dimension = ai.active_dimension();

        let store = Arc::new(SqliteStore::open(&vault_db_path(path), dimension)?);
        let repository = Arc::new(NoteRepository::new(
            store.clone(),
            &config.vector_search_engine,
        )?);

        let pipeline = Arc::new(IndexPipeline::new(
            repository.clone(),
            ai.clone(),
            &config.indexing,
        ));
        pipeline.start_workers();

        let watcher = Arc::new(VaultWatcher::new(
            pipeline.clone(),
            repository.clone(),
            config.watcher.debounce_ms.max(1) as u64,
            config.indexing.shutdown_grace_secs.max(0) as u64,
        ));

        let rag = Arc::new(RagEngine::new(
            repository.clone(),
            ai.clone(),
            config.rag.clone(),
        ));
        let graph = Arc::new(GraphBuilder::new(repository.clone(), config.graph.clone()));

        // Resumable migration of legacy embedding blobs, in the background.
        let migrator_cancel = CancellationToken::new();
        {
            let migrator = VectorMigrator::new(
                store,
                config.indexing.migration_batch_size.max(1) as usize,
            );
            let cancel = migrator_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = migrator.run(&cancel).await {
                    tracing::warn!(error = %e, "vector migration failed");
                }
            });
        }

        if config.watcher.enabled {
            watcher.start(path).await?;
        }

        let state = Arc::new(VaultState {
            root: path.to_path_buf(),
            vault: VaultFiles::new(path),
            config: StdRwLock::new(config),
            repository,
            ai,
            pipeline,
            watcher,
            rag,
            graph,
            migrator_cancel,
        });
        *self.state.write().await = Some(state);

        tracing::info!(vault = %path.display(), "vault opened");
        Ok(())
    }

    /// Currently open vault root.
    pub async fn current_vault(&self) -> Option<PathBuf> {
        self.state.read().await.as_ref().map(|s| s.root.clone())
    }

    /// Close the current vault, draining background work.
    pub async fn close_vault(&self) {
        let _guard = self.switch_guard.lock().await;
        if let Some(state) = self.state.write().await.take() {
            state.shutdown().await;
            tracing::info!(vault = %state.root.display(), "vault closed");
        }
    }

    async fn state(&self) -> Result<Arc<VaultState>> {
        self.state
            .read()
            .await
            .clone()
            .ok_or(NotebitErr::NotFound {
                what: "vault",
                key: "no vault open".to_string(),
            })
    }

    // ------------------------------------------------------------------
    // File operations (side effects feed the indexing pipeline)
    // ------------------------------------------------------------------

    /// Notes on disk, vault-relative paths.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let state = self.state().await?;
        Ok(tokio::task::spawn_blocking(move || state.vault.list())
            .await
            .unwrap_or_default())
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.state().await?.vault.read(path).await
    }

    /// Save always succeeds when the filesystem write succeeds; indexing
    /// is best-effort and asynchronous.
    pub async fn save_file(&self, path: &str, content: &str) -> Result<()> {
        let state = self.state().await?;
        let meta = state.vault.write(path, content).await?;
        state
            .pipeline
            .enqueue_save(
                path,
                content.to_string(),
                meta.mtime,
                meta.size,
                IndexOptions::default(),
            )
            .await;
        Ok(())
    }

    pub async fn create_file(&self, path: &str, content: &str) -> Result<()> {
        let state = self.state().await?;
        let meta = state.vault.create(path, content).await?;
        state
            .pipeline
            .enqueue_save(
                path,
                content.to_string(),
                meta.mtime,
                meta.size,
                IndexOptions::default(),
            )
            .await;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let state = self.state().await?;
        state.vault.delete(path).await?;
        state.pipeline.enqueue_remove(path).await;
        Ok(())
    }

    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        let state = self.state().await?;
        state.vault.rename(old_path, new_path).await?;

        // Path rewrite first so existing chunks survive, then a reindex
        // of the new path picks up any content-dependent title change.
        if let Err(e) = state.repository.rename_file(old_path, new_path).await {
            tracing::debug!(old = %old_path, new = %new_path, error = %e, "rename without index row");
        }
        let content = state.vault.read(new_path).await?;
        let meta = state.vault.metadata(new_path).await?;
        state
            .pipeline
            .enqueue_save(
                new_path,
                content,
                meta.mtime,
                meta.size,
                IndexOptions::default(),
            )
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Index operations
    // ------------------------------------------------------------------

    /// Enqueue one path for indexing; the skip test makes this a no-op
    /// for unchanged, fully embedded files.
    pub async fn index_file(&self, path: &str) -> Result<()> {
        let state = self.state().await?;
        let content = state.vault.read(path).await?;
        let meta = state.vault.metadata(path).await?;
        state
            .pipeline
            .enqueue_save(path, content, meta.mtime, meta.size, IndexOptions::default())
            .await;
        Ok(())
    }

    /// Full rescan with progress, including pruning of rows whose files
    /// vanished outside the watcher's observation window.
    pub async fn reindex_all(&self) -> Result<()> {
        let state = self.state().await?;
        state.pipeline.reindex_all(&state.root, false).await
    }

    pub async fn get_index_progress(&self) -> Result<ProgressSnapshot> {
        Ok(self.state().await?.pipeline.progress())
    }

    /// Wait until the indexing queue drains. Intended for tests and CLI.
    pub async fn wait_for_indexing(&self) -> Result<()> {
        let state = self.state().await?;
        state.pipeline.wait_idle().await;
        Ok(())
    }

    pub async fn get_indexed_file(&self, path: &str) -> Result<Option<NoteFile>> {
        self.state().await?.repository.get_file_by_path(path).await
    }

    pub async fn list_indexed_files(&self) -> Result<Vec<NoteFile>> {
        self.state().await?.repository.list_files().await
    }

    pub async fn remove_from_index(&self, path: &str) -> Result<bool> {
        self.state().await?.repository.delete_file(path).await
    }

    pub async fn get_database_stats(&self) -> Result<DatabaseStats> {
        self.state().await?.repository.get_stats().await
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub async fn get_config(&self) -> Result<AppConfig> {
        let state = self.state().await?;
        let config = state.config.read().unwrap_or_else(|p| p.into_inner());
        Ok(config.clone())
    }

    pub async fn get_embedding_provider(&self) -> Result<String> {
        Ok(self.get_config().await?.ai.provider)
    }

    pub async fn set_embedding_provider(&self, provider: &str) -> Result<()> {
        self.update_ai_config(|ai| ai.provider = provider.to_string())
            .await
    }

    pub async fn get_openai_config(&self) -> Result<OpenAiConfig> {
        Ok(self.get_config().await?.ai.openai)
    }

    pub async fn set_openai_config(&self, openai: OpenAiConfig) -> Result<()> {
        self.update_ai_config(|ai| ai.openai = openai).await
    }

    pub async fn get_ollama_config(&self) -> Result<OllamaConfig> {
        Ok(self.get_config().await?.ai.ollama)
    }

    pub async fn set_ollama_config(&self, ollama: OllamaConfig) -> Result<()> {
        self.update_ai_config(|ai| ai.ollama = ollama).await
    }

    pub async fn get_llm_config(&self) -> Result<LlmConfig> {
        Ok(self.get_config().await?.ai.llm)
    }

    pub async fn set_llm_config(&self, llm: LlmConfig) -> Result<()> {
        self.update_ai_config(|ai| ai.llm = llm).await
    }

    pub async fn get_chunking_config(&self) -> Result<ChunkingConfig> {
        Ok(self.get_config().await?.chunking)
    }

    pub async fn set_chunking_config(&self, chunking: ChunkingConfig) -> Result<()> {
        let state = self.state().await?;
        let (ai_config, chunking) = {
            let mut config = state.config.write().unwrap_or_else(|p| p.into_inner());
            config.chunking = chunking;
            config.validate()?;
            (config.ai.clone(), config.chunking.clone())
        };
        state.ai.reconfigure(&ai_config, &chunking)
    }

    pub async fn get_rag_config(&self) -> Result<RagConfig> {
        Ok(self.state().await?.rag.config())
    }

    pub async fn set_rag_config(&self, rag: RagConfig) -> Result<()> {
        let state = self.state().await?;
        {
            let mut config = state.config.write().unwrap_or_else(|p| p.into_inner());
            config.rag = rag.clone();
            config.validate()?;
        }
        state.rag.set_config(rag);
        Ok(())
    }

    pub async fn get_graph_config(&self) -> Result<GraphConfig> {
        Ok(self.state().await?.graph.config())
    }

    pub async fn set_graph_config(&self, graph: GraphConfig) -> Result<()> {
        let state = self.state().await?;
        {
            let mut config = state.config.write().unwrap_or_else(|p| p.into_inner());
            config.graph = graph.clone();
            config.validate()?;
        }
        state.graph.set_config(graph);
        Ok(())
    }

    pub async fn get_ai_status(&self) -> Result<AiStatus> {
        Ok(self.state().await?.ai.status())
    }

    /// Probe the embedding provider; returns `(model, dimension)`.
    pub async fn test_openai_connection(&self) -> Result<(String, i32)> {
        self.state().await?.ai.test_embedding_connection().await
    }

    /// Apply an AI-config mutation and rebuild the providers.
    ///
    /// A dimension-changing model switch requires reopening the vault;
    /// until then new vectors are committed with `vec_indexed` unset.
    async fn update_ai_config(&self, mutate: impl FnOnce(&mut AiConfig)) -> Result<()> {
        let state = self.state().await?;
        let (ai_config, chunking) = {
            let mut config = state.config.write().unwrap_or_else(|p| p.into_inner());
            mutate(&mut config.ai);
            config.validate()?;
            (config.ai.clone(), config.chunking.clone())
        };
        state.ai.reconfigure(&ai_config, &chunking)?;

        let new_dimension = state.ai.active_dimension();
        let store_dimension = state.repository.store().dimension();
        if new_dimension != store_dimension {
            tracing::warn!(
                configured = new_dimension,
                schema = store_dimension,
                "embedding dimension changed; reopen the vault to reinitialize the vector index"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Top-K chunks similar to free-form content.
    pub async fn find_similar(&self, content: &str, limit: usize) -> Result<Vec<SimilarNote>> {
        let state = self.state().await?;
        let query = state.ai.embed_query(content).await?;
        state.repository.search_similar(&query, limit).await
    }

    pub async fn get_similarity_status(&self) -> Result<SimilarityStatus> {
        let state = self.state().await?;
        let stats = state.repository.get_stats().await?;
        Ok(SimilarityStatus {
            available: state.ai.status().available,
            total_chunks: stats.chunk_count,
            indexed_chunks: stats.embedded_chunk_count,
        })
    }

    pub async fn get_vector_engine(&self) -> Result<EngineSelection> {
        Ok(self.state().await?.repository.current_vector_engine())
    }

    /// Select the vector engine; records the choice in the live config.
    pub async fn set_vector_engine(&self, name: &str) -> Result<EngineSelection> {
        let state = self.state().await?;
        let selection = state.repository.select_vector_engine(name)?;
        {
            let mut config = state.config.write().unwrap_or_else(|p| p.into_inner());
            config.vector_search_engine = selection.requested.clone();
        }
        Ok(selection)
    }

    // ------------------------------------------------------------------
    // RAG
    // ------------------------------------------------------------------

    pub async fn rag_query(&self, session_id: &str, query: &str) -> Result<RagResponse> {
        self.state().await?.rag.query(session_id, query).await
    }

    pub async fn rag_query_stream(
        &self,
        session_id: &str,
        query: &str,
    ) -> Result<(String, mpsc::Receiver<RagEvent>)> {
        self.state().await?.rag.query_stream(session_id, query).await
    }

    pub async fn cancel_rag_query(&self, message_id: &str) -> Result<bool> {
        Ok(self.state().await?.rag.cancel(message_id))
    }

    pub async fn get_rag_status(&self) -> Result<RagStatus> {
        Ok(self.state().await?.rag.status())
    }

    // ------------------------------------------------------------------
    // Graph
    // ------------------------------------------------------------------

    pub async fn get_graph_data(&self) -> Result<Arc<GraphData>> {
        self.state().await?.graph.build().await
    }

    // ------------------------------------------------------------------
    // Subsystem handles (for hosts needing direct access)
    // ------------------------------------------------------------------

    pub async fn repository(&self) -> Result<Arc<NoteRepository>> {
        Ok(self.state().await?.repository.clone())
    }

    pub async fn ai(&self) -> Result<Arc<AiService>> {
        Ok(self.state().await?.ai.clone())
    }
}

impl VaultState {
    /// Stop background work: watcher first, then pipeline, then migrator.
    async fn shutdown(&self) {
        self.watcher.stop().await;
        self.pipeline.stop().await;
        self.migrator_cancel.cancel();
    }
}
