//! notebit-core
//!
//! Knowledge-indexing and retrieval core for a local-first Markdown notes
//! vault.
//!
//! ## Subsystems
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | `storage` | SQLite repository, pluggable vector engines, migration |
//! | `ai` | Embedding/completion providers, retry and batching |
//! | `indexing` | The single queue + worker pool all index events feed |
//! | `watcher` | Debounced filesystem events and the bootstrap scan |
//! | `rag` | Retrieval-augmented chat with `[Source N]` citations |
//! | `graph` | Explicit wiki-link and implicit similarity edges |
//! | `service` | Coordinator wiring and the host-facing surface |
//!
//! ## Quick start
//!
//! ```ignore
//! use notebit_core::NotebitService;
//!
//! let service = NotebitService::new();
//! service.open_vault(&vault_root).await?;
//! service.save_file("ideas.md", "# Ideas\n\n...").await?;
//! let hits = service.find_similar("that idea about gardens", 5).await?;
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod service;
pub mod types;
pub mod vault;

// Subsystems
pub mod ai;
pub mod chunking;
pub mod graph;
pub mod indexing;
pub mod rag;
pub mod storage;
pub mod watcher;

// Re-exports
pub use ai::AiService;
pub use ai::AiStatus;
pub use config::AppConfig;
pub use error::NotebitErr;
pub use error::Result;
pub use graph::GraphBuilder;
pub use graph::GraphData;
pub use indexing::IndexOptions;
pub use indexing::IndexPipeline;
pub use indexing::ProgressSnapshot;
pub use rag::RagEngine;
pub use rag::RagEvent;
pub use rag::RagResponse;
pub use service::NotebitService;
pub use service::SimilarityStatus;
pub use storage::NoteRepository;
pub use storage::SqliteStore;
pub use storage::VectorEngine;
pub use types::DatabaseStats;
pub use types::NoteFile;
pub use types::SimilarNote;
pub use watcher::VaultWatcher;
