//! On-disk cache of extracted transcript text.
//!
//! One file per `(transcript_id, source_url)`, named by the sha256 content
//! key. Re-analyses (force runs, group research) read from here instead of
//! re-downloading the source document.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::idempotency::content_key;

#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("Failed to create content dir {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Content I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Directory of extracted transcript text files.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) the content directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ContentStoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| ContentStoreError::CreateDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, transcript_id: i64, source_url: &str) -> PathBuf {
        self.root
            .join(format!("{}.txt", content_key(transcript_id, source_url)))
    }

    /// Read cached text, if present.
    pub fn load(&self, transcript_id: i64, source_url: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(transcript_id, source_url)).ok()
    }

    /// Persist extracted text and return its path for the transcript row's
    /// `content_path` column.
    pub fn save(
        &self,
        transcript_id: i64,
        source_url: &str,
        text: &str,
    ) -> Result<PathBuf, ContentStoreError> {
        let path = self.path_for(transcript_id, source_url);
        std::fs::write(&path, text).map_err(|source| ContentStoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ContentStore::open(dir.path().join("content")).expect("open");

        assert!(store.load(1, "https://example.com/t.pdf").is_none());

        let path = store
            .save(1, "https://example.com/t.pdf", "quarterly results text")
            .expect("save");
        assert!(path.exists());

        let loaded = store.load(1, "https://example.com/t.pdf").expect("load");
        assert_eq!(loaded, "quarterly results text");
    }

    #[test]
    fn test_distinct_urls_do_not_collide() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ContentStore::open(dir.path()).expect("open");

        store.save(1, "https://a.example/t.pdf", "first").unwrap();
        store.save(1, "https://b.example/t.pdf", "second").unwrap();

        assert_eq!(store.load(1, "https://a.example/t.pdf").unwrap(), "first");
        assert_eq!(store.load(1, "https://b.example/t.pdf").unwrap(), "second");
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("content");
        let _first = ContentStore::open(&root).expect("first open");
        let _second = ContentStore::open(&root).expect("second open");
    }
}
