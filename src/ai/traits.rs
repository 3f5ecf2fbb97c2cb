//! Capability traits for embedding and completion providers.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A chat message in provider wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Completion request parameters.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: i32,
}

/// Non-streaming completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    /// Total tokens reported by the provider, when available.
    pub tokens: Option<i64>,
}

/// One element of a streaming completion.
///
/// The stream is a lazy, finite sequence of deltas terminated by exactly
/// one `Done` or `Error` marker.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done { tokens: Option<i64> },
    Error(String),
}

/// Receiver half of a streaming completion.
pub type CompletionStream = mpsc::Receiver<StreamEvent>;

/// Embedding capability.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for status reporting.
    fn name(&self) -> &'static str;

    /// Model used when the caller does not pick one.
    fn default_model(&self) -> &str;

    /// Embed a single text.
    async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Probe the provider with a minimal request.
    async fn validate(&self) -> Result<()>;
}

/// Completion capability.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for status reporting.
    fn name(&self) -> &'static str;

    /// Run a completion to the end.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Stream a completion as text deltas.
    ///
    /// Cancelling the token aborts the underlying HTTP request; the stream
    /// then closes without a `Done` marker.
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream>;

    /// Probe the provider with a minimal request.
    async fn validate(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let sys = ChatMessage::system("be brief");
        assert_eq!(sys.role, "system");
        let user = ChatMessage::user("hello");
        assert_eq!(user.role, "user");
        assert_eq!(user.content, "hello");
    }

    #[test]
    fn test_stream_event_equality() {
        assert_eq!(
            StreamEvent::Delta("a".to_string()),
            StreamEvent::Delta("a".to_string())
        );
        assert_ne!(
            StreamEvent::Done { tokens: Some(1) },
            StreamEvent::Done { tokens: None }
        );
    }
}
