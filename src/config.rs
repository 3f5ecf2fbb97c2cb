//! Configuration for the indexing and retrieval core.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::NotebitErr;
use crate::error::Result;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// AI provider configuration
    #[serde(default)]
    pub ai: AiConfig,

    /// Indexing pipeline configuration
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Filesystem watcher configuration
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// RAG query configuration
    #[serde(default)]
    pub rag: RagConfig,

    /// Graph builder configuration
    #[serde(default)]
    pub graph: GraphConfig,

    /// Vector search engine: "sqlite-vec" or "brute-force"
    #[serde(default = "default_vector_engine")]
    pub vector_search_engine: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ai: AiConfig::default(),
            indexing: IndexingConfig::default(),
            watcher: WatcherConfig::default(),
            chunking: ChunkingConfig::default(),
            rag: RagConfig::default(),
            graph: GraphConfig::default(),
            vector_search_engine: default_vector_engine(),
        }
    }
}

fn default_vector_engine() -> String {
    "sqlite-vec".to_string()
}

/// AI provider selection and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiConfig {
    /// Active embedding provider: "local" (Ollama) or "remote" (OpenAI)
    #[serde(default = "default_ai_provider")]
    pub provider: String,

    /// Embedding dimension declared at schema creation
    #[serde(default = "default_vector_dimension")]
    pub vector_dimension: i32,

    /// Texts per embedding request
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,

    /// Embedding request timeout in seconds
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: i32,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Ollama-compatible provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Completion model settings
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            vector_dimension: default_vector_dimension(),
            batch_size: default_batch_size(),
            embed_timeout_secs: default_embed_timeout_secs(),
            openai: OpenAiConfig::default(),
            ollama: OllamaConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

fn default_ai_provider() -> String {
    "local".to_string()
}
/// Default embedding dimension (OpenAI text-embedding-3-small).
pub fn default_vector_dimension() -> i32 {
    1536
}
fn default_batch_size() -> i32 {
    32
}
fn default_embed_timeout_secs() -> i32 {
    30
}

/// OpenAI-compatible provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OpenAiConfig {
    /// API key; empty disables the provider
    #[serde(default)]
    pub api_key: String,

    /// Base URL override (defaults to api.openai.com)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Optional organization header
    #[serde(default)]
    pub organization: Option<String>,

    /// Embedding model
    #[serde(default = "default_openai_embedding_model")]
    pub embedding_model: String,
}

fn default_openai_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// Ollama-compatible provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OllamaConfig {
    /// Server base URL
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Embedding model
    #[serde(default = "default_ollama_embedding_model")]
    pub embedding_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            embedding_model: default_ollama_embedding_model(),
        }
    }
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

/// Completion model settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    /// Completion provider: "local" or "remote"
    #[serde(default = "default_ai_provider")]
    pub provider: String,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Maximum tokens for a response
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: i32,

    /// Streaming completion timeout in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: i32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_max_tokens() -> i32 {
    2048
}
fn default_llm_timeout_secs() -> i32 {
    120
}

/// Indexing pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexingConfig {
    /// Worker count for the indexing pool
    #[serde(default = "default_worker_count")]
    pub worker_count: i32,

    /// Queue capacity; producers block (or get backpressure) beyond this
    #[serde(default = "default_queue_size")]
    pub queue_size: i32,

    /// Rows per batch for the vector-index migrator
    #[serde(default = "default_migration_batch_size")]
    pub migration_batch_size: i32,

    /// Grace period for stop() before outstanding jobs are cancelled
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: i32,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_size: default_queue_size(),
            migration_batch_size: default_migration_batch_size(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_worker_count() -> i32 {
    4
}
fn default_queue_size() -> i32 {
    256
}
fn default_migration_batch_size() -> i32 {
    500
}
fn default_shutdown_grace_secs() -> i32 {
    5
}

/// Filesystem watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfig {
    /// Whether the watcher starts with the vault
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-path debounce window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> i32 {
    500
}

/// Chunking strategy selection and bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    /// Strategy: "heading", "fixed", "sliding" or "sentence"
    #[serde(default = "default_chunk_strategy")]
    pub strategy: String,

    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i32,

    /// Overlap between consecutive chunks (sliding strategy)
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: i32,

    /// Minimum chunk size; smaller trailing chunks merge into the previous
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: i32,

    /// Hard upper bound on chunk size
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: i32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_chunk_strategy(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

fn default_chunk_strategy() -> String {
    "heading".to_string()
}
fn default_chunk_size() -> i32 {
    1000
}
fn default_chunk_overlap() -> i32 {
    200
}
fn default_min_chunk_size() -> i32 {
    100
}
fn default_max_chunk_size() -> i32 {
    4000
}

/// RAG query configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagConfig {
    /// Top-K chunks retrieved as context
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: i32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// System prompt; instructs [Source N] citations
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            max_context_chunks: default_max_context_chunks(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_max_context_chunks() -> i32 {
    5
}
fn default_temperature() -> f32 {
    0.7
}
fn default_system_prompt() -> String {
    "You are an assistant answering questions about the user's personal notes. \
     Answer only from the provided context. Cite the passages you use with their \
     [Source N] tag. If the context does not contain the answer, say so instead \
     of guessing."
        .to_string()
}

/// Graph builder configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphConfig {
    /// Minimum similarity for an implicit edge
    #[serde(default = "default_min_similarity_threshold")]
    pub min_similarity_threshold: f32,

    /// Maximum number of files considered for implicit edges
    #[serde(default = "default_max_nodes")]
    pub max_nodes: i32,

    /// Whether implicit edges are computed at all
    #[serde(default = "default_true")]
    pub show_implicit_links: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            min_similarity_threshold: default_min_similarity_threshold(),
            max_nodes: default_max_nodes(),
            show_implicit_links: true,
        }
    }
}

fn default_min_similarity_threshold() -> f32 {
    0.6
}
fn default_max_nodes() -> i32 {
    100
}

impl GraphConfig {
    /// Stable fingerprint for cache invalidation.
    pub fn fingerprint(&self) -> String {
        format!(
            "{:.4}:{}:{}",
            self.min_similarity_threshold, self.max_nodes, self.show_implicit_links
        )
    }
}

impl AppConfig {
    /// Load configuration for a vault.
    ///
    /// Search order (first found wins):
    /// 1. `{vault}/.notebit.toml` (vault-level)
    /// 2. `~/.notebit.toml` (global)
    /// 3. Defaults
    pub fn load(vault_root: &Path) -> Result<Self> {
        let vault_config = vault_root.join(".notebit.toml");
        if vault_config.exists() {
            return Self::from_file(&vault_config);
        }

        if let Some(home) = dirs::home_dir() {
            let global_config = home.join(".notebit.toml");
            if global_config.exists() {
                return Self::from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| NotebitErr::ConfigParse {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| NotebitErr::ConfigParse {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })
    }

    /// Validate configuration values.
    ///
    /// Numeric bounds prevent zero-sized pools, empty queues and
    /// out-of-range thresholds from wedging a subsystem at startup.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, cause: String) -> NotebitErr {
            NotebitErr::Config {
                field: field.to_string(),
                cause,
            }
        }

        match self.ai.provider.as_str() {
            "local" | "remote" => {}
            other => {
                return Err(invalid(
                    "ai.provider",
                    format!("must be 'local' or 'remote', got '{other}'"),
                ));
            }
        }
        if self.ai.vector_dimension <= 0 {
            return Err(invalid(
                "ai.vector_dimension",
                format!("must be positive, got {}", self.ai.vector_dimension),
            ));
        }
        if self.ai.batch_size <= 0 {
            return Err(invalid(
                "ai.batch_size",
                format!("must be positive, got {}", self.ai.batch_size),
            ));
        }
        if self.indexing.worker_count <= 0 {
            return Err(invalid(
                "indexing.worker_count",
                format!("must be positive, got {}", self.indexing.worker_count),
            ));
        }
        if self.indexing.queue_size <= 0 {
            return Err(invalid(
                "indexing.queue_size",
                format!("must be positive, got {}", self.indexing.queue_size),
            ));
        }
        if self.indexing.migration_batch_size <= 0 {
            return Err(invalid(
                "indexing.migration_batch_size",
                format!(
                    "must be positive, got {}",
                    self.indexing.migration_batch_size
                ),
            ));
        }
        if self.watcher.debounce_ms <= 0 {
            return Err(invalid(
                "watcher.debounce_ms",
                format!("must be positive, got {}", self.watcher.debounce_ms),
            ));
        }
        match self.chunking.strategy.as_str() {
            "heading" | "fixed" | "sliding" | "sentence" => {}
            other => {
                return Err(invalid(
                    "chunking.strategy",
                    format!("unknown strategy '{other}'"),
                ));
            }
        }
        if self.chunking.chunk_size <= 0 {
            return Err(invalid(
                "chunking.chunk_size",
                format!("must be positive, got {}", self.chunking.chunk_size),
            ));
        }
        if self.chunking.chunk_overlap < 0
            || self.chunking.chunk_overlap >= self.chunking.chunk_size
        {
            return Err(invalid(
                "chunking.chunk_overlap",
                format!(
                    "must be in [0, chunk_size), got {}",
                    self.chunking.chunk_overlap
                ),
            ));
        }
        if self.chunking.min_chunk_size <= 0
            || self.chunking.min_chunk_size >= self.chunking.chunk_size
        {
            return Err(invalid(
                "chunking.min_chunk_size",
                format!(
                    "must be in (0, chunk_size), got {}",
                    self.chunking.min_chunk_size
                ),
            ));
        }
        if self.chunking.max_chunk_size < self.chunking.chunk_size {
            return Err(invalid(
                "chunking.max_chunk_size",
                format!(
                    "must be >= chunk_size ({}), got {}",
                    self.chunking.chunk_size, self.chunking.max_chunk_size
                ),
            ));
        }
        if self.rag.max_context_chunks <= 0 {
            return Err(invalid(
                "rag.max_context_chunks",
                format!("must be positive, got {}", self.rag.max_context_chunks),
            ));
        }
        if !(0.0..=2.0).contains(&self.rag.temperature) {
            return Err(invalid(
                "rag.temperature",
                format!("must be in [0, 2], got {}", self.rag.temperature),
            ));
        }
        if !(0.0..=1.0).contains(&self.graph.min_similarity_threshold) {
            return Err(invalid(
                "graph.min_similarity_threshold",
                format!(
                    "must be in [0, 1], got {}",
                    self.graph.min_similarity_threshold
                ),
            ));
        }
        if self.graph.max_nodes <= 0 {
            return Err(invalid(
                "graph.max_nodes",
                format!("must be positive, got {}", self.graph.max_nodes),
            ));
        }
        match self.vector_search_engine.as_str() {
            "sqlite-vec" | "brute-force" => {}
            other => {
                return Err(invalid(
                    "vector_search_engine",
                    format!("must be 'sqlite-vec' or 'brute-force', got '{other}'"),
                ));
            }
        }

        Ok(())
    }
}

/// Data directory for a vault (index database and sidecars live here).
pub fn vault_data_dir(vault_root: &Path) -> PathBuf {
    vault_root.join("data")
}

/// Index database path for a vault.
pub fn vault_db_path(vault_root: &Path) -> PathBuf {
    vault_data_dir(vault_root).join("notebit.sqlite")
}
