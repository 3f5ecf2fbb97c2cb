//! AI capability layer: provider selection, retry, batching.

pub mod ollama;
pub mod openai;
pub mod traits;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use ollama::OllamaCompletions;
pub use ollama::OllamaEmbeddings;
pub use openai::OpenAiCompletions;
pub use openai::OpenAiEmbeddings;
pub use traits::ChatMessage;
pub use traits::Completion;
pub use traits::CompletionProvider;
pub use traits::CompletionRequest;
pub use traits::CompletionStream;
pub use traits::EmbeddingProvider;
pub use traits::StreamEvent;

use crate::chunking::DocumentChunker;
use crate::config::AiConfig;
use crate::config::ChunkingConfig;
use crate::error::NotebitErr;
use crate::error::Result;
use crate::types::ChunkInput;

/// Retry policy for embedding calls: 3 attempts, 500 ms start, doubling.
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Known embedding model output dimensions.
///
/// This table is the only authoritative source of dimensions; unknown
/// models fall back to the configured default.
static MODEL_DIMENSIONS: Lazy<HashMap<&'static str, i32>> = Lazy::new(|| {
    HashMap::from([
        ("text-embedding-3-small", 1536),
        ("text-embedding-3-large", 3072),
        ("text-embedding-ada-002", 1536),
        ("nomic-embed-text", 768),
        ("mxbai-embed-large", 1024),
        ("all-minilm", 384),
        ("snowflake-arctic-embed", 1024),
        ("bge-m3", 1024),
    ])
});

/// Output dimension for a model name, colon suffix stripped, falling back
/// to `default` for unknown models.
pub fn model_dimension(model: &str, default: i32) -> i32 {
    if let Some(dim) = MODEL_DIMENSIONS.get(model) {
        return *dim;
    }
    let base = model.split(':').next().unwrap_or(model);
    MODEL_DIMENSIONS.get(base).copied().unwrap_or(default)
}

/// Non-blocking AI availability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AiStatus {
    pub available: bool,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub llm_provider: String,
    pub llm_model: String,
}

/// Mutable settings re-read on each use after a config change.
#[derive(Debug, Clone)]
struct AiSettings {
    batch_size: usize,
    default_dimension: i32,
    llm_model: String,
    llm_max_tokens: i32,
}

/// Shared AI service holding the active providers.
///
/// Provider slots are behind a read-write lock; callers clone the `Arc`
/// out and never hold the guard across an await.
pub struct AiService {
    embedder: RwLock<Option<Arc<dyn EmbeddingProvider>>>,
    completer: RwLock<Option<Arc<dyn CompletionProvider>>>,
    chunker: RwLock<DocumentChunker>,
    settings: RwLock<AiSettings>,
}

impl AiService {
    /// Build providers from configuration.
    ///
    /// A remote provider with no API key is treated as absent; semantic
    /// features then degrade instead of failing at startup.
    pub fn from_config(ai: &AiConfig, chunking: &ChunkingConfig) -> Result<Self> {
        let service = Self {
            embedder: RwLock::new(None),
            completer: RwLock::new(None),
            chunker: RwLock::new(DocumentChunker::new(chunking)?),
            settings: RwLock::new(AiSettings {
                batch_size: ai.batch_size.max(1) as usize,
                default_dimension: ai.vector_dimension,
                llm_model: ai.llm.model.clone(),
                llm_max_tokens: ai.llm.max_tokens,
            }),
        };
        service.reconfigure(ai, chunking)?;
        Ok(service)
    }

    /// Rebuild providers after a configuration change.
    pub fn reconfigure(&self, ai: &AiConfig, chunking: &ChunkingConfig) -> Result<()> {
        let embed_timeout = Duration::from_secs(ai.embed_timeout_secs.max(1) as u64);
        let llm_timeout = Duration::from_secs(ai.llm.timeout_secs.max(1) as u64);

        let embedder: Option<Arc<dyn EmbeddingProvider>> = match ai.provider.as_str() {
            "remote" => {
                if ai.openai.api_key.is_empty() {
                    tracing::warn!("remote embedding provider selected without an API key");
                    None
                } else {
                    let mut provider = OpenAiEmbeddings::new(ai.openai.api_key.clone())
                        .with_model(ai.openai.embedding_model.clone())
                        .with_organization(ai.openai.organization.clone())
                        .with_timeout(embed_timeout);
                    if let Some(base_url) = &ai.openai.base_url {
                        provider = provider.with_base_url(base_url.clone());
                    }
                    Some(Arc::new(provider))
                }
            }
            _ => Some(Arc::new(
                OllamaEmbeddings::new(ai.ollama.base_url.clone())
                    .with_model(ai.ollama.embedding_model.clone())
                    .with_timeout(embed_timeout),
            )),
        };

        let completer: Option<Arc<dyn CompletionProvider>> = match ai.llm.provider.as_str() {
            "remote" => {
                if ai.openai.api_key.is_empty() {
                    None
                } else {
                    let mut provider = OpenAiCompletions::new(ai.openai.api_key.clone())
                        .with_organization(ai.openai.organization.clone())
                        .with_timeout(llm_timeout);
                    if let Some(base_url) = &ai.openai.base_url {
                        provider = provider.with_base_url(base_url.clone());
                    }
                    Some(Arc::new(provider))
                }
            }
            _ => Some(Arc::new(
                OllamaCompletions::new(ai.ollama.base_url.clone()).with_timeout(llm_timeout),
            )),
        };

        *self.embedder.write().unwrap_or_else(|p| p.into_inner()) = embedder;
        *self.completer.write().unwrap_or_else(|p| p.into_inner()) = completer;
        *self.chunker.write().unwrap_or_else(|p| p.into_inner()) = DocumentChunker::new(chunking)?;
        *self.settings.write().unwrap_or_else(|p| p.into_inner()) = AiSettings {
            batch_size: ai.batch_size.max(1) as usize,
            default_dimension: ai.vector_dimension,
            llm_model: ai.llm.model.clone(),
            llm_max_tokens: ai.llm.max_tokens,
        };
        Ok(())
    }

    /// Replace the embedding provider directly.
    pub fn set_embedding_provider(&self, provider: Option<Arc<dyn EmbeddingProvider>>) {
        *self.embedder.write().unwrap_or_else(|p| p.into_inner()) = provider;
    }

    /// Replace the completion provider directly.
    pub fn set_completion_provider(&self, provider: Option<Arc<dyn CompletionProvider>>) {
        *self.completer.write().unwrap_or_else(|p| p.into_inner()) = provider;
    }

    fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        self.embedder
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| NotebitErr::ai("no embedding provider configured"))
    }

    fn completer(&self) -> Result<Arc<dyn CompletionProvider>> {
        self.completer
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| NotebitErr::ai("no completion provider configured"))
    }

    fn settings(&self) -> AiSettings {
        self.settings
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Embed a query string, with retry.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder()?;
        with_retry("embed", || async { embedder.embed(text, None).await }).await
    }

    /// Embed a batch of texts with retry, splitting into provider batches.
    ///
    /// Partial failure of a sub-batch fails the whole call; the indexing
    /// pipeline owns the fallback.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = self.embedder()?;
        let batch_size = self.settings().batch_size;

        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            let result =
                with_retry("embed_batch", || async { embedder.embed_batch(batch).await }).await?;
            if result.len() != batch.len() {
                return Err(NotebitErr::ai(format!(
                    "provider returned {} embeddings for {} texts",
                    result.len(),
                    batch.len()
                )));
            }
            embeddings.extend(result);
        }
        Ok(embeddings)
    }

    /// Chunk a document and fill embeddings for every chunk.
    pub async fn process_document(&self, content: &str) -> Result<Vec<ChunkInput>> {
        let spans = self.chunk_spans(content);
        if spans.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = self.embedder()?;
        let model = embedder.default_model().to_string();

        let texts: Vec<String> = spans.iter().map(|s| s.content.clone()).collect();
        let embeddings = self.embed_texts(&texts).await?;

        Ok(spans
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(position, (span, embedding))| ChunkInput {
                position: position as i32,
                content: span.content,
                heading: span.heading,
                embedding: Some(embedding),
                embedding_model: model.clone(),
            })
            .collect())
    }

    /// Chunk a document without embeddings (offline fallback).
    pub fn chunk_document(&self, content: &str) -> Vec<ChunkInput> {
        self.chunk_spans(content)
            .into_iter()
            .enumerate()
            .map(|(position, span)| ChunkInput {
                position: position as i32,
                content: span.content,
                heading: span.heading,
                embedding: None,
                embedding_model: String::new(),
            })
            .collect()
    }

    fn chunk_spans(&self, content: &str) -> Vec<crate::chunking::ChunkSpan> {
        self.chunker
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .chunk(content)
    }

    /// Run a completion with the configured model.
    pub async fn complete(&self, messages: Vec<ChatMessage>, temperature: f32) -> Result<Completion> {
        let completer = self.completer()?;
        let settings = self.settings();
        completer
            .complete(&CompletionRequest {
                messages,
                model: settings.llm_model,
                temperature,
                max_tokens: settings.llm_max_tokens,
            })
            .await
    }

    /// Stream a completion with the configured model.
    pub async fn complete_stream(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        let completer = self.completer()?;
        let settings = self.settings();
        completer
            .complete_stream(
                &CompletionRequest {
                    messages,
                    model: settings.llm_model,
                    temperature,
                    max_tokens: settings.llm_max_tokens,
                },
                cancel,
            )
            .await
    }

    /// Probe the embedding provider; returns `(model, dimension)`.
    pub async fn test_embedding_connection(&self) -> Result<(String, i32)> {
        let embedder = self.embedder()?;
        let model = embedder.default_model().to_string();
        let vector = embedder.embed("connection test", None).await?;
        Ok((model, vector.len() as i32))
    }

    /// Dimension for the active embedding model.
    pub fn active_dimension(&self) -> i32 {
        let settings = self.settings();
        match self.embedder() {
            Ok(embedder) => model_dimension(embedder.default_model(), settings.default_dimension),
            Err(_) => settings.default_dimension,
        }
    }

    /// Snapshot of provider availability. Never performs I/O.
    pub fn status(&self) -> AiStatus {
        let settings = self.settings();
        let embedder = self.embedder.read().unwrap_or_else(|p| p.into_inner());
        let completer = self.completer.read().unwrap_or_else(|p| p.into_inner());
        AiStatus {
            available: embedder.is_some(),
            embedding_provider: embedder
                .as_ref()
                .map(|e| e.name().to_string())
                .unwrap_or_default(),
            embedding_model: embedder
                .as_ref()
                .map(|e| e.default_model().to_string())
                .unwrap_or_default(),
            llm_provider: completer
                .as_ref()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            llm_model: settings.llm_model,
        }
    }
}

/// Retry with exponential backoff: up to 3 attempts, 500 ms initial delay,
/// doubling, no jitter.
async fn with_retry<T, F, Fut>(what: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(
                    what = what,
                    attempt = attempt,
                    error = %e,
                    "AI call failed"
                );
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| NotebitErr::ai("retry exhausted")))
}
