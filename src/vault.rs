//! Note file operations inside the vault root.
//!
//! The core reads `*.md` recursively and writes user notes only on behalf
//! of explicit host calls; its own state lives under `<vault>/data/`.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::error::NotebitErr;
use crate::error::Result;
use crate::types::is_markdown_path;

/// Filesystem metadata captured at read/write time.
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub mtime: i64,
    pub size: i64,
}

/// True for paths the watcher and scanner must skip.
///
/// The rules are fixed: directory components `.git`, `node_modules`,
/// `.idea`, `data` (the index directory), any dot-prefixed component, and
/// editor artifacts (`.swp`, `~`, `.tmp`).
pub fn is_ignored(rel_path: &Path) -> bool {
    for component in rel_path.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        let Some(name) = name.to_str() else {
            return true;
        };
        if name.starts_with('.') {
            return true;
        }
        if matches!(name, ".git" | "node_modules" | ".idea" | "data") {
            return true;
        }
    }
    if let Some(name) = rel_path.file_name().and_then(|n| n.to_str()) {
        if name.ends_with(".swp") || name.ends_with('~') || name.ends_with(".tmp") {
            return true;
        }
    }
    false
}

/// True when the path should be indexed: not ignored and markdown.
pub fn is_indexable(rel_path: &Path) -> bool {
    !is_ignored(rel_path) && is_markdown_path(rel_path)
}

/// Walk the vault and return `(relative, absolute)` paths of all
/// indexable markdown files, sorted by relative path.
pub fn scan_notes(root: &Path) -> Vec<(String, PathBuf)> {
    let mut notes = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();

    for entry in walker.filter_entry(|e| {
        let rel = e.path().strip_prefix(root).unwrap_or(e.path());
        rel.as_os_str().is_empty() || !is_ignored(rel)
    }) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let abs = entry.path().to_path_buf();
        let Ok(rel) = abs.strip_prefix(root) else {
            continue;
        };
        if !is_markdown_path(rel) {
            continue;
        }
        notes.push((normalize_rel(rel), abs));
    }

    notes.sort_by(|a, b| a.0.cmp(&b.0));
    notes
}

/// Convert a relative path to the canonical `/`-separated form used as
/// file identity.
pub fn normalize_rel(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// File operations rooted at a vault directory.
#[derive(Debug, Clone)]
pub struct VaultFiles {
    root: PathBuf,
}

impl VaultFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative note path, rejecting escapes and the data dir.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel.is_empty() || rel_path.is_absolute() {
            return Err(NotebitErr::InvalidPath {
                path: rel_path.to_path_buf(),
            });
        }
        for component in rel_path.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(NotebitErr::InvalidPath {
                        path: rel_path.to_path_buf(),
                    });
                }
            }
        }
        if rel_path
            .components()
            .next()
            .is_some_and(|c| c.as_os_str() == "data")
        {
            return Err(NotebitErr::InvalidPath {
                path: rel_path.to_path_buf(),
            });
        }
        Ok(self.root.join(rel_path))
    }

    /// Read a note's content.
    pub async fn read(&self, rel: &str) -> Result<String> {
        let path = self.resolve(rel)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| NotebitErr::vault_io(&path, e))
    }

    /// Filesystem metadata for a note.
    pub async fn metadata(&self, rel: &str) -> Result<FileMeta> {
        let path = self.resolve(rel)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| NotebitErr::vault_io(&path, e))?;
        Ok(FileMeta {
            mtime: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            size: meta.len() as i64,
        })
    }

    /// Write a note, creating parent directories as needed.
    pub async fn write(&self, rel: &str, content: &str) -> Result<FileMeta> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NotebitErr::vault_io(parent, e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| NotebitErr::vault_io(&path, e))?;
        self.metadata(rel).await
    }

    /// Create a new note; fails if it already exists.
    pub async fn create(&self, rel: &str, content: &str) -> Result<FileMeta> {
        let path = self.resolve(rel)?;
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| NotebitErr::vault_io(&path, e))?
        {
            return Err(NotebitErr::VaultIo {
                path,
                cause: "file already exists".to_string(),
            });
        }
        self.write(rel, content).await
    }

    /// Delete a note.
    pub async fn delete(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| NotebitErr::vault_io(&path, e))
    }

    /// Rename a note, creating target parent directories as needed.
    pub async fn rename(&self, old_rel: &str, new_rel: &str) -> Result<()> {
        let old_path = self.resolve(old_rel)?;
        let new_path = self.resolve(new_rel)?;
        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NotebitErr::vault_io(parent, e))?;
        }
        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| NotebitErr::vault_io(&old_path, e))
    }

    /// List indexable notes, relative paths only.
    pub fn list(&self) -> Vec<String> {
        scan_notes(&self.root).into_iter().map(|(rel, _)| rel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ignore_rules() {
        assert!(is_ignored(Path::new(".git/config")));
        assert!(is_ignored(Path::new("notes/node_modules/x.md")));
        assert!(is_ignored(Path::new(".idea/workspace.xml")));
        assert!(is_ignored(Path::new("data/notebit.sqlite")));
        assert!(is_ignored(Path::new(".hidden/note.md")));
        assert!(is_ignored(Path::new("notes/.draft.md")));
        assert!(is_ignored(Path::new("notes/a.swp")));
        assert!(is_ignored(Path::new("notes/a.md~")));
        assert!(is_ignored(Path::new("notes/a.tmp")));
        assert!(!is_ignored(Path::new("notes/a.md")));
        assert!(!is_ignored(Path::new("database/a.md")));
    }

    #[test]
    fn test_is_indexable() {
        assert!(is_indexable(Path::new("a.md")));
        assert!(is_indexable(Path::new("deep/dir/B.MD")));
        assert!(!is_indexable(Path::new("a.txt")));
        assert!(!is_indexable(Path::new("data/a.md")));
    }

    #[tokio::test]
    async fn test_scan_finds_markdown_only() {
        let dir = TempDir::new().unwrap();
        let vault = VaultFiles::new(dir.path());
        vault.write("a.md", "# A").await.unwrap();
        vault.write("sub/b.md", "# B").await.unwrap();
        vault.write("c.txt", "not a note").await.unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/d.md"), "ignored").unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/e.md"), "ignored").unwrap();

        let notes = scan_notes(dir.path());
        let rels: Vec<&str> = notes.iter().map(|(rel, _)| rel.as_str()).collect();
        assert_eq!(rels, ["a.md", "sub/b.md"]);
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let dir = TempDir::new().unwrap();
        let vault = VaultFiles::new(dir.path());
        let meta = vault.write("notes/x.md", "# X\nbody").await.unwrap();
        assert!(meta.size > 0);
        assert_eq!(vault.read("notes/x.md").await.unwrap(), "# X\nbody");
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let dir = TempDir::new().unwrap();
        let vault = VaultFiles::new(dir.path());
        vault.create("x.md", "one").await.unwrap();
        assert!(vault.create("x.md", "two").await.is_err());
        assert_eq!(vault.read("x.md").await.unwrap(), "one");
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let dir = TempDir::new().unwrap();
        let vault = VaultFiles::new(dir.path());
        vault.write("x.md", "content").await.unwrap();
        vault.rename("x.md", "sub/y.md").await.unwrap();
        assert!(vault.read("x.md").await.is_err());
        assert_eq!(vault.read("sub/y.md").await.unwrap(), "content");
        vault.delete("sub/y.md").await.unwrap();
        assert!(vault.read("sub/y.md").await.is_err());
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let vault = VaultFiles::new("/vault");
        assert!(vault.resolve("../outside.md").is_err());
        assert!(vault.resolve("/etc/passwd").is_err());
        assert!(vault.resolve("").is_err());
        assert!(vault.resolve("notes/../../outside.md").is_err());
        assert!(vault.resolve("data/notebit.sqlite").is_err());
        assert!(vault.resolve("notes/ok.md").is_ok());
    }

    #[test]
    fn test_normalize_rel() {
        assert_eq!(normalize_rel(Path::new("a/b/c.md")), "a/b/c.md");
    }
}
