//! OpenAI-compatible embedding and completion providers.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::ChatMessage;
use super::traits::Completion;
use super::traits::CompletionProvider;
use super::traits::CompletionRequest;
use super::traits::CompletionStream;
use super::traits::EmbeddingProvider;
use super::traits::StreamEvent;
use crate::error::NotebitErr;
use crate::error::Result;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// OpenAI-compatible embeddings over `/embeddings`.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddings {
    api_key: String,
    organization: Option<String>,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            organization: None,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_trailing_slash(base_url.into());
        self
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    async fn request_embeddings(&self, model: &str, input: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: model.to_string(),
            input,
            encoding_format: Some("float".to_string()),
        };

        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request);
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        let response = builder.send().await.map_err(NotebitErr::ai)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotebitErr::ai(format!("embeddings API error {status}: {body}")));
        }

        let result: EmbeddingResponse = response.json().await.map_err(NotebitErr::ai)?;

        // The API may reorder entries; restore request order by index.
        let mut embeddings: Vec<(i32, Vec<f32>)> = result
            .data
            .into_iter()
            .map(|e| (e.index, e.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);
        Ok(embeddings.into_iter().map(|(_, e)| e).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>> {
        let model = model.unwrap_or(&self.model);
        let results = self.request_embeddings(model, vec![text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| NotebitErr::ai("empty embeddings response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request_embeddings(&self.model, texts.to_vec()).await
    }

    async fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(NotebitErr::ai("no API key configured"));
        }
        self.embed("ping", None).await.map(|_| ())
    }
}

/// OpenAI-compatible chat completions over `/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiCompletions {
    api_key: String,
    organization: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompletions {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            organization: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_trailing_slash(base_url.into());
        self
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
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
        format!("{}/chat/completions", self.base_url)
    }

    fn builder(&self, body: &ChatRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body);
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        builder
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletions {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = ChatRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
            stream_options: None,
        };

        let response = self.builder(&body).send().await.map_err(NotebitErr::ai)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotebitErr::ai(format!("chat API error {status}: {body}")));
        }

        let result: ChatResponse = response.json().await.map_err(NotebitErr::ai)?;
        let text = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| NotebitErr::ai("empty chat response"))?;
        Ok(Completion {
            text,
            tokens: result.usage.map(|u| u.total_tokens),
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        let body = ChatRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        let response = self.builder(&body).send().await.map_err(NotebitErr::ai)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotebitErr::ai(format!("chat API error {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut tokens: Option<i64> = None;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        // Dropping the stream aborts the HTTP request; the
                        // channel closes without a Done marker.
                        return;
                    }

                    next = stream.next() => {
                        let Some(chunk) = next else { break };
                        let chunk = match chunk {
                            Ok(c) => c,
                            Err(e) => {
                                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                                return;
                            }
                        };
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);
                            match parse_sse_line(&line) {
                                SseLine::Delta(delta) => {
                                    if tx.send(StreamEvent::Delta(delta)).await.is_err() {
                                        return;
                                    }
                                }
                                SseLine::Usage(total) => tokens = Some(total),
                                SseLine::Done => {
                                    let _ = tx.send(StreamEvent::Done { tokens }).await;
                                    return;
                                }
                                SseLine::Skip => {}
                            }
                        }
                    }
                }
            }
            // Stream ended without an explicit [DONE].
            let _ = tx.send(StreamEvent::Done { tokens }).await;
        });

        Ok(rx)
    }

    async fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(NotebitErr::ai("no API key configured"));
        }
        Ok(())
    }
}

/// Parsed server-sent-event line.
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Usage(i64),
    Done,
    Skip,
}

/// Parse one SSE line of an OpenAI-compatible chat stream.
fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(chunk) = serde_json::from_str::<ChatStreamChunk>(data) else {
        return SseLine::Skip;
    };
    if let Some(usage) = chunk.usage {
        return SseLine::Usage(usage.total_tokens);
    }
    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();
    if delta.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Delta(delta)
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: i32,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: i32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: Option<ChatStreamDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamDelta {
    content: Option<String>,
}
