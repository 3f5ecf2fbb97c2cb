//! Error types for the indexing and retrieval core.

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NotebitErr>;

/// Errors produced by the indexing and retrieval core.
#[derive(Debug, Error)]
pub enum NotebitErr {
    /// Invalid configuration value. The affected subsystem refuses to start.
    #[error("invalid config '{field}': {cause}")]
    Config { field: String, cause: String },

    /// Configuration file could not be parsed.
    #[error("failed to parse config {path}: {cause}")]
    ConfigParse { path: PathBuf, cause: String },

    /// Filesystem error inside the vault.
    #[error("vault I/O error at {path}: {cause}")]
    VaultIo { path: PathBuf, cause: String },

    /// Path escapes the vault root or is otherwise not a valid note path.
    #[error("invalid note path: {path}")]
    InvalidPath { path: PathBuf },

    /// The index database could not be opened or is unusable.
    #[error("database unavailable at {path}: {cause}")]
    DbUnavailable { path: PathBuf, cause: String },

    /// A database operation failed.
    #[error("database operation '{operation}' failed: {cause}")]
    Database { operation: String, cause: String },

    /// No embedding or completion provider is reachable.
    #[error("AI provider unavailable: {cause}")]
    AiUnavailable { cause: String },

    /// A stored or queried vector does not match the schema dimension.
    /// Fatal for the accelerated engine; requires schema re-initialization.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: i32, actual: i32 },

    /// The indexing queue is at capacity.
    #[error("indexing queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The operation was cancelled by the caller. Not an error for the
    /// caller, but surfaced so a UI can report it.
    #[error("operation cancelled")]
    Cancelled,

    /// A requested record does not exist.
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    /// Filesystem watcher failure.
    #[error("watcher error: {cause}")]
    Watcher { cause: String },
}

impl NotebitErr {
    /// Database error with operation context.
    pub fn db(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::Database {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Vault I/O error with path context.
    pub fn vault_io(path: &Path, cause: impl ToString) -> Self {
        Self::VaultIo {
            path: path.to_path_buf(),
            cause: cause.to_string(),
        }
    }

    /// AI-layer error.
    pub fn ai(cause: impl ToString) -> Self {
        Self::AiUnavailable {
            cause: cause.to_string(),
        }
    }

    /// True if this error means the AI backend is offline or failing,
    /// which the indexing pipeline degrades around rather than surfacing.
    pub fn is_ai_unavailable(&self) -> bool {
        matches!(self, Self::AiUnavailable { .. })
    }
}

impl From<rusqlite::Error> for NotebitErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database {
            operation: "query".to_string(),
            cause: e.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for NotebitErr {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Database {
                operation: "join blocking task".to_string(),
                cause: e.to_string(),
            }
        }
    }
}

/// Extension trait mapping `QueryReturnedNoRows` to `None`.
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_constructor() {
        let err = NotebitErr::db("insert chunk", "disk full");
        assert!(matches!(err, NotebitErr::Database { .. }));
        assert!(err.to_string().contains("insert chunk"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_vault_io_constructor() {
        let err = NotebitErr::vault_io(Path::new("/vault/a.md"), "permission denied");
        assert!(matches!(err, NotebitErr::VaultIo { .. }));
        assert!(err.to_string().contains("/vault/a.md"));
    }

    #[test]
    fn test_ai_unavailable_predicate() {
        assert!(NotebitErr::ai("connection refused").is_ai_unavailable());
        assert!(!NotebitErr::Cancelled.is_ai_unavailable());
    }

    #[test]
    fn test_from_rusqlite() {
        let err: NotebitErr = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, NotebitErr::Database { .. }));
    }

    #[test]
    fn test_optional_maps_no_rows() {
        let no_rows: std::result::Result<i64, rusqlite::Error> =
            Err(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(no_rows.optional().unwrap(), None);

        let ok: std::result::Result<i64, rusqlite::Error> = Ok(7);
        assert_eq!(ok.optional().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_from_join_error() {
        let handle = tokio::spawn(async { 1 });
        handle.abort();
        if let Err(e) = handle.await {
            let err: NotebitErr = e.into();
            assert!(matches!(err, NotebitErr::Cancelled));
        }
    }
}
