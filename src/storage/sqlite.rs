//! SQLite store for the vault index.
//!
//! `rusqlite::Connection` is not `Sync`, so the connection lives behind an
//! `Arc<Mutex<_>>` and every operation runs on the blocking pool.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use rusqlite::Connection;
use tokio::task::spawn_blocking;

use crate::error::NotebitErr;
use crate::error::Result;

/// Current schema version. Bumps are applied transactionally through
/// `schema_versions`.
const SCHEMA_VERSION: i64 = 1;

/// Async-safe SQLite store with the vec0 extension loaded.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    dimension: i32,
}

impl SqliteStore {
    /// Open or create the index database with the given vector dimension.
    ///
    /// If an existing vec0 table declares a different dimension, the vector
    /// index is dropped and recreated and all `vec_indexed` flags are
    /// cleared; the migrator repopulates the index from stored blobs.
    pub fn open(db_path: &Path, dimension: i32) -> Result<Self> {
        if dimension <= 0 {
            return Err(NotebitErr::Config {
                field: "ai.vector_dimension".to_string(),
                cause: format!("must be positive, got {dimension}"),
            });
        }

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| NotebitErr::DbUnavailable {
                path: db_path.to_path_buf(),
                cause: format!("failed to create data dir: {e}"),
            })?;
        }

        // Register sqlite-vec before opening.
        //
        // SAFETY: `sqlite3_vec_init` is the extension entry point provided by
        // the sqlite-vec crate. `sqlite3_auto_extension` expects a function
        // pointer with the SQLite extension init signature; the transmute
        // converts the concrete fn pointer into the `Option<unsafe extern
        // "C" fn()>` the FFI boundary wants. This is the documented pattern
        // from the sqlite-vec crate README.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }

        let conn = Connection::open(db_path).map_err(|e| NotebitErr::DbUnavailable {
            path: db_path.to_path_buf(),
            cause: e.to_string(),
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -65536;",
        )
        .map_err(|e| NotebitErr::DbUnavailable {
            path: db_path.to_path_buf(),
            cause: format!("pragma init failed: {e}"),
        })?;

        Self::validate_or_reset_dimension(&conn, dimension)?;
        Self::apply_migrations(&conn)?;
        Self::init_vec_table(&conn, dimension)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
            dimension,
        })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Vector dimension declared at schema creation.
    pub fn dimension(&self) -> i32 {
        self.dimension
    }

    /// Run a read or autocommit write on the blocking pool.
    pub async fn query<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| NotebitErr::db("spawn_blocking", e))?
    }

    /// Run a closure inside a single transaction on the blocking pool.
    ///
    /// The transaction commits when the closure returns `Ok` and rolls back
    /// otherwise; no partial write is ever visible.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let tx = guard
                .transaction()
                .map_err(|e| NotebitErr::db("begin transaction", e))?;
            let result = f(&tx)?;
            tx.commit().map_err(|e| NotebitErr::db("commit", e))?;
            Ok(result)
        })
        .await
        .map_err(|e| NotebitErr::db("spawn_blocking", e))?
    }

    /// Apply pending schema migrations, each inside its own transaction.
    fn apply_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| NotebitErr::db("create schema_versions", e))?;

        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_versions",
                [],
                |r| r.get(0),
            )
            .map_err(|e| NotebitErr::db("read schema version", e))?;

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            conn.execute_batch(&format!(
                "BEGIN;
                 {sql}
                 INSERT INTO schema_versions (version, applied_at)
                 VALUES ({version}, strftime('%s', 'now'));
                 COMMIT;"
            ))
            .map_err(|e| NotebitErr::db(format!("apply migration v{version}"), e))?;
            tracing::info!(version = version, "Applied schema migration");
        }

        Ok(())
    }

    /// Create the vec0 virtual table if missing.
    fn init_vec_table(conn: &Connection, dimension: i32) -> Result<()> {
        let sql = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(
                chunk_id integer PRIMARY KEY,
                embedding float[{dimension}] distance_metric=cosine
            )"
        );
        conn.execute_batch(&sql)
            .map_err(|e| NotebitErr::db("create vec_chunks", e))?;
        Ok(())
    }

    /// Drop the vec0 table when its declared dimension differs from the
    /// configured one, clearing `vec_indexed` so the migrator can rebuild.
    fn validate_or_reset_dimension(conn: &Connection, dimension: i32) -> Result<()> {
        let create_sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'vec_chunks'",
                [],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(NotebitErr::db("read vec_chunks schema", other)),
            })?;

        let Some(create_sql) = create_sql else {
            return Ok(());
        };
        let Some(stored) = parse_vec_dimension(&create_sql) else {
            return Ok(());
        };

        if stored != dimension {
            tracing::warn!(
                stored = stored,
                requested = dimension,
                "Vector dimension changed; reinitializing vector index"
            );
            conn.execute_batch("DROP TABLE IF EXISTS vec_chunks")
                .map_err(|e| NotebitErr::db("drop vec_chunks", e))?;
            // chunks may not exist yet on a fresh database
            let _ = conn.execute("UPDATE chunks SET vec_indexed = 0", []);
        }

        Ok(())
    }
}

/// Parse the dimension out of a vec0 CREATE statement (`float[N]`).
fn parse_vec_dimension(create_sql: &str) -> Option<i32> {
    let start = create_sql.find("float[")?;
    let after = &create_sql[start + 6..];
    let end = after.find(']')?;
    after[..end].trim().parse::<i32>().ok()
}

/// Schema migrations as `(version, sql)` pairs, applied in order.
const MIGRATIONS: &[(i64, &str)] = &[(
    SCHEMA_VERSION,
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        mtime INTEGER NOT NULL,
        size INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_files_title ON files(title);
    CREATE INDEX IF NOT EXISTS idx_files_content_hash ON files(content_hash);

    CREATE TABLE IF NOT EXISTS chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        content TEXT NOT NULL,
        heading TEXT NOT NULL DEFAULT '',
        embedding BLOB,
        embedding_model TEXT NOT NULL DEFAULT '',
        embedded_at INTEGER,
        vec_indexed INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id);
    CREATE INDEX IF NOT EXISTS idx_chunks_embedding_model ON chunks(embedding_model);
    CREATE INDEX IF NOT EXISTS idx_chunks_vec_indexed ON chunks(vec_indexed);

    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS file_tags (
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (file_id, tag_id)
    );",
)];
