//! Retrieval-augmented chat over the vault index.
//!
//! A query is embedded, the top-K chunks are retrieved and assembled into
//! numbered `[Source N]` context blocks, and a completion is requested
//! with a system prompt that instructs citation by tag. Streaming answers
//! flow through an event channel keyed by a generated message id.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ai::AiService;
use crate::ai::ChatMessage;
use crate::ai::StreamEvent;
use crate::config::RagConfig;
use crate::error::NotebitErr;
use crate::error::Result;
use crate::storage::NoteRepository;
use crate::types::SimilarNote;

/// A context chunk that backed an answer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RagSource {
    pub chunk_id: i64,
    pub path: String,
    pub title: String,
    pub heading: String,
    pub similarity: f32,
}

/// Completed RAG response.
#[derive(Debug, Clone, Serialize)]
pub struct RagResponse {
    pub message_id: String,
    pub content: String,
    pub sources: Vec<RagSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,
}

/// Streaming RAG event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RagEvent {
    Delta {
        message_id: String,
        text: String,
    },
    Done {
        message_id: String,
        sources: Vec<RagSource>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_used: Option<i64>,
    },
    Error {
        message_id: String,
        message: String,
    },
}

/// Non-blocking RAG availability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RagStatus {
    pub available: bool,
    pub llm_provider: String,
    pub llm_model: String,
    pub database_ready: bool,
}

/// The RAG query engine.
pub struct RagEngine {
    repository: Arc<NoteRepository>,
    ai: Arc<AiService>,
    config: RwLock<RagConfig>,
    /// In-flight queries by message id, for cancellation. Entries are
    /// removed when the stream finishes or is cancelled.
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl RagEngine {
    pub fn new(repository: Arc<NoteRepository>, ai: Arc<AiService>, config: RagConfig) -> Self {
        Self {
            repository,
            ai,
            config: RwLock::new(config),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> RagConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_config(&self, config: RagConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Answer a query, blocking until the completion finishes.
    pub async fn query(&self, session_id: &str, query: &str) -> Result<RagResponse> {
        let message_id = Uuid::new_v4().to_string();
        let config = self.config();
        tracing::debug!(session_id = session_id, message_id = %message_id, "rag query");

        let (messages, sources) = self.prepare(query, &config).await?;
        let completion = self.ai.complete(messages, config.temperature).await?;

        Ok(RagResponse {
            message_id,
            content: completion.text,
            sources,
            tokens_used: completion.tokens,
        })
    }

    /// Answer a query as a stream of [`RagEvent`]s.
    ///
    /// Returns the generated message id and the event channel. The stream
    /// ends with exactly one `Done` or `Error` event, unless the query is
    /// cancelled first, in which case the channel simply closes and
    /// partial content is discarded.
    pub async fn query_stream(
        &self,
        session_id: &str,
        query: &str,
    ) -> Result<(String, mpsc::Receiver<RagEvent>)> {
        let message_id = Uuid::new_v4().to_string();
        let config = self.config();
        tracing::debug!(session_id = session_id, message_id = %message_id, "rag stream query");

        let (messages, sources) = self.prepare(query, &config).await?;

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(message_id.clone(), cancel.clone());

        let mut completion_rx = self
            .ai
            .complete_stream(messages, config.temperature, cancel.clone())
            .await
            .inspect_err(|_| {
                self.active
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&message_id);
            })?;

        let (tx, rx) = mpsc::channel(64);
        let id = message_id.clone();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            while let Some(event) = completion_rx.recv().await {
                let out = match event {
                    StreamEvent::Delta(text) => RagEvent::Delta {
                        message_id: id.clone(),
                        text,
                    },
                    StreamEvent::Done { tokens } => RagEvent::Done {
                        message_id: id.clone(),
                        sources: sources.clone(),
                        tokens_used: tokens,
                    },
                    StreamEvent::Error(message) => RagEvent::Error {
                        message_id: id.clone(),
                        message,
                    },
                };
                let terminal = !matches!(out, RagEvent::Delta { .. });
                if tx.send(out).await.is_err() || terminal {
                    break;
                }
            }
            active
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
        });

        Ok((message_id, rx))
    }

    /// Cancel an in-flight query: aborts the HTTP request and closes the
    /// delta channel. Partial content is never persisted.
    pub fn cancel(&self, message_id: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(token) = active.remove(message_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Availability probe; never blocks on I/O.
    pub fn status(&self) -> RagStatus {
        let ai = self.ai.status();
        RagStatus {
            available: ai.available && !ai.llm_provider.is_empty(),
            llm_provider: ai.llm_provider,
            llm_model: ai.llm_model,
            database_ready: true,
        }
    }

    /// Embed, retrieve and assemble the completion messages.
    async fn prepare(
        &self,
        query: &str,
        config: &RagConfig,
    ) -> Result<(Vec<ChatMessage>, Vec<RagSource>)> {
        let query_vector = self
            .ai
            .embed_query(query)
            .await
            .map_err(|e| NotebitErr::ai(format!("query embedding failed: {e}")))?;

        let hits = self
            .repository
            .search_similar(&query_vector, config.max_context_chunks.max(1) as usize)
            .await?;

        let (context, sources) = assemble_context(&hits);
        let messages = vec![
            ChatMessage::system(config.system_prompt.clone()),
            ChatMessage::system(format!("Context:\n{context}")),
            ChatMessage::user(query),
        ];
        Ok((messages, sources))
    }
}

/// Build the numbered context block and the source list.
///
/// Ordering preserves descending similarity; duplicate chunk ids are
/// elided. Each block reads `[Source N] <title> [#heading] — <content>`.
fn assemble_context(hits: &[SimilarNote]) -> (String, Vec<RagSource>) {
    let mut seen: HashSet<i64> = HashSet::new();
    let mut blocks = Vec::new();
    let mut sources = Vec::new();

    for hit in hits {
        if !seen.insert(hit.chunk_id) {
            continue;
        }
        let n = sources.len() + 1;
        let heading_part = if hit.heading.is_empty() {
            String::new()
        } else {
            format!(" [#{}]", hit.heading)
        };
        blocks.push(format!(
            "[Source {n}] {}{} — {}",
            hit.title, heading_part, hit.content
        ));
        sources.push(RagSource {
            chunk_id: hit.chunk_id,
            path: hit.path.clone(),
            title: hit.title.clone(),
            heading: hit.heading.clone(),
            similarity: hit.similarity,
        });
    }

    if blocks.is_empty() {
        return ("(no matching notes)".to_string(), sources);
    }
    (blocks.join("\n\n"), sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::test_service;
    use crate::ai::testing::TEST_DIMENSION;
    use crate::config::IndexingConfig;
    use crate::indexing::IndexOptions;
    use crate::indexing::IndexPipeline;
    use crate::storage::SqliteStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        engine: RagEngine,
        ai: Arc<AiService>,
    }

    async fn fixture_with_note(path: &str, content: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open(&dir.path().join("data/notebit.sqlite"), TEST_DIMENSION as i32)
                .unwrap(),
        );
        let repository = Arc::new(NoteRepository::new(store, "sqlite-vec").unwrap());
        let ai = Arc::new(test_service("The note mentions a fox [Source 1]."));

        let pipeline = Arc::new(IndexPipeline::new(
            repository.clone(),
            ai.clone(),
            &IndexingConfig::default(),
        ));
        pipeline.start_workers();
        pipeline
            .enqueue_save(
                path,
                content.to_string(),
                1,
                content.len() as i64,
                IndexOptions::default(),
            )
            .await;
        pipeline.wait_idle().await;

        let engine = RagEngine::new(repository, ai.clone(), RagConfig::default());
        Fixture {
            _dir: dir,
            engine,
            ai,
        }
    }

    #[test]
    fn test_assemble_context_numbering_and_dedup() {
        let hit = |id: i64, title: &str, heading: &str, sim: f32| SimilarNote {
            chunk_id: id,
            path: format!("{title}.md"),
            title: title.to_string(),
            heading: heading.to_string(),
            content: format!("content of {title}"),
            similarity: sim,
        };
        let hits = vec![
            hit(1, "Alpha", "Intro", 0.9),
            hit(2, "Beta", "", 0.8),
            hit(1, "Alpha", "Intro", 0.9), // duplicate elided
        ];
        let (context, sources) = assemble_context(&hits);

        assert!(context.contains("[Source 1] Alpha [#Intro] — content of Alpha"));
        assert!(context.contains("[Source 2] Beta — content of Beta"));
        assert!(!context.contains("[Source 3]"));
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].chunk_id, 1);
        assert_eq!(sources[1].chunk_id, 2);
    }

    #[test]
    fn test_assemble_context_empty() {
        let (context, sources) = assemble_context(&[]);
        assert_eq!(context, "(no matching notes)");
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn test_query_returns_sources() {
        let fx = fixture_with_note("a.md", "# Alpha\n\nThe quick brown fox").await;
        let response = fx
            .engine
            .query("session-1", "What animal is mentioned?")
            .await
            .unwrap();

        assert!(!response.message_id.is_empty());
        assert!(!response.content.is_empty());
        assert!(!response.sources.is_empty());
        assert!(response.sources.iter().any(|s| s.path == "a.md"));
        assert!(response.tokens_used.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_query_stream_delivers_deltas_then_done() {
        let fx = fixture_with_note("a.md", "# Alpha\n\nThe quick brown fox").await;
        let (message_id, mut rx) = fx
            .engine
            .query_stream("session-1", "What animal is mentioned?")
            .await
            .unwrap();

        let mut text = String::new();
        let mut done = false;
        while let Some(event) = rx.recv().await {
            match event {
                RagEvent::Delta {
                    message_id: id,
                    text: delta,
                } => {
                    assert_eq!(id, message_id);
                    text.push_str(&delta);
                }
                RagEvent::Done {
                    message_id: id,
                    sources,
                    tokens_used,
                } => {
                    assert_eq!(id, message_id);
                    assert!(!sources.is_empty());
                    assert!(tokens_used.unwrap() > 0);
                    done = true;
                }
                RagEvent::Error { message, .. } => panic!("unexpected error: {message}"),
            }
        }
        assert!(done);
        assert!(text.contains("fox"));
    }

    #[tokio::test]
    async fn test_ai_offline_is_typed_error() {
        let fx = fixture_with_note("a.md", "# Alpha\n\nfox").await;
        fx.ai.set_embedding_provider(None);
        let err = fx.engine.query("s", "anything").await.unwrap_err();
        assert!(err.is_ai_unavailable());
    }

    #[tokio::test]
    async fn test_cancel_unknown_message() {
        let fx = fixture_with_note("a.md", "# Alpha\n\nfox").await;
        assert!(!fx.engine.cancel("no-such-id"));
    }

    #[tokio::test]
    async fn test_status_reports_provider() {
        let fx = fixture_with_note("a.md", "# Alpha\n\nfox").await;
        let status = fx.engine.status();
        assert!(status.available);
        assert!(status.database_ready);
        assert_eq!(status.llm_provider, "test-echo");

        fx.ai.set_completion_provider(None);
        assert!(!fx.engine.status().available);
    }
}
