//! Ollama-compatible local providers.
//!
//! The embeddings API only takes a single text per request, so batches are
//! synthesized by issuing requests concurrently under a bounded semaphore.
//! Chat goes through Ollama's OpenAI-compatible `/v1/chat/completions`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::openai::OpenAiCompletions;
use super::traits::Completion;
use super::traits::CompletionProvider;
use super::traits::CompletionRequest;
use super::traits::CompletionStream;
use super::traits::EmbeddingProvider;
use crate::error::NotebitErr;
use crate::error::Result;

/// Maximum concurrent embedding requests against the local server.
const MAX_CONCURRENT_EMBEDS: usize = 5;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Ollama embeddings over `/api/embeddings`.
#[derive(Debug, Clone)]
pub struct OllamaEmbeddings {
    base_url: String,
    model: String,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl OllamaEmbeddings {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if base_url.is_empty() {
            base_url = DEFAULT_BASE_URL.to_string();
        }
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            client: reqwest::Client::new(),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_EMBEDS)),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embeddings", self.base_url)
    }

    async fn request_embedding(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbedRequest {
            model: model.to_string(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(NotebitErr::ai)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotebitErr::ai(format!("ollama API error {status}: {body}")));
        }

        let result: OllamaEmbedResponse = response.json().await.map_err(NotebitErr::ai)?;
        if result.embedding.is_empty() {
            return Err(NotebitErr::ai("ollama returned an empty embedding"));
        }
        Ok(result.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>> {
        let model = model.unwrap_or(&self.model);
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| NotebitErr::ai("embedding semaphore closed"))?;
        self.request_embedding(model, text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Fan out under the semaphore; order is restored by join position.
        let futures = texts.iter().map(|text| self.embed(text, None));
        let results = futures::future::join_all(futures).await;

        let mut embeddings = Vec::with_capacity(results.len());
        for result in results {
            embeddings.push(result?);
        }
        Ok(embeddings)
    }

    async fn validate(&self) -> Result<()> {
        self.embed("ping", None).await.map(|_| ())
    }
}

/// Ollama chat through its OpenAI-compatible endpoint.
pub struct OllamaCompletions {
    inner: OpenAiCompletions,
}

impl OllamaCompletions {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if base_url.is_empty() {
            base_url = DEFAULT_BASE_URL.to_string();
        }
        while base_url.ends_with('/') {
            base_url.pop();
        }
        // Ollama serves the OpenAI surface under /v1 and ignores the key.
        let inner = OpenAiCompletions::new("ollama").with_base_url(format!("{base_url}/v1"));
        Self { inner }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.inner = self.inner.with_timeout(timeout);
        self
    }
}

#[async_trait]
impl CompletionProvider for OllamaCompletions {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.inner.complete(request).await
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        self.inner.complete_stream(request, cancel).await
    }

    async fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}
