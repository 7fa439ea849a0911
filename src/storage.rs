//! Artifact persistence.
//!
//! The pipeline only knows `upload(bytes, key) -> url`. Retries belong to the store, not to the
//! pipeline: a failed upload is reported once and the page result keeps its score.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::StoreSpec;
use crate::error::{ForensicError, Result};

pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` under `key` and return a URL the caller can hand to reviewers.
    fn upload(&self, bytes: &[u8], key: &str) -> Result<String>;
}

/// `{document_id}/gradcam/{file_stem}_page{N}_gradcam.png`
pub fn artifact_key(document_id: &str, file_name: &str, page: u32) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    format!("{}/gradcam/{}_page{}_gradcam.png", document_id, stem, page)
}

fn upload_failed(key: &str, reason: impl std::fmt::Display) -> ForensicError {
    ForensicError::StorageUploadFailed {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Writes artifacts as plain files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(upload_failed(key, "key must be a relative path without '..'"));
        }
        Ok(self.root.join(relative))
    }
}

impl ArtifactStore for DirectoryStore {
    fn upload(&self, bytes: &[u8], key: &str) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| upload_failed(key, e))?;
        }
        fs::write(&path, bytes).map_err(|e| upload_failed(key, e))?;
        info!(key, bytes = bytes.len(), "artifact written");
        Ok(format!("file://{}", path.display()))
    }
}

/// Keeps artifacts in a sled tree keyed by artifact key.
pub struct SledStore {
    db: sled::Db,
    location: String,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| {
            ForensicError::Config(format!("cannot open sled store {}: {}", path.display(), e))
        })?;
        Ok(Self {
            db,
            location: path.display().to_string(),
        })
    }
}

impl ArtifactStore for SledStore {
    fn upload(&self, bytes: &[u8], key: &str) -> Result<String> {
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| upload_failed(key, e))?;
        self.db.flush().map_err(|e| upload_failed(key, e))?;
        info!(key, bytes = bytes.len(), "artifact stored");
        Ok(format!("sled://{}/{}", self.location, key))
    }
}

pub fn open_store(spec: &StoreSpec) -> Result<Arc<dyn ArtifactStore>> {
    let store: Arc<dyn ArtifactStore> = match spec {
        StoreSpec::Directory(root) => Arc::new(DirectoryStore::new(root.clone())),
        StoreSpec::Sled(path) => Arc::new(SledStore::open(path)?),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(
            artifact_key("LID12345678", "offer_letter.pdf", 2),
            "LID12345678/gradcam/offer_letter_page2_gradcam.png"
        );
        assert_eq!(
            artifact_key("C9", "scan", 1),
            "C9/gradcam/scan_page1_gradcam.png"
        );
    }

    #[test]
    fn directory_store_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let key = artifact_key("LID1", "payslip.png", 1);
        let url = store.upload(b"png-bytes", &key).unwrap();
        assert!(url.starts_with("file://"));
        let written = fs::read(dir.path().join(&key)).unwrap();
        assert_eq!(written, b"png-bytes");
    }

    #[test]
    fn directory_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let err = store.upload(b"x", "../outside.png").unwrap_err();
        assert_eq!(err.kind(), "StorageUploadFailed");
        assert!(store.upload(b"x", "/abs.png").is_err());
    }

    #[test]
    fn sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts");
        let store = SledStore::open(&path).unwrap();
        let url = store.upload(b"overlay", "LID1/gradcam/a_page1_gradcam.png").unwrap();
        assert!(url.starts_with("sled://"));
        assert!(url.ends_with("LID1/gradcam/a_page1_gradcam.png"));
        drop(store);

        // Flushed on upload, so a fresh handle sees it.
        let db = sled::open(&path).unwrap();
        let stored = db.get("LID1/gradcam/a_page1_gradcam.png").unwrap().unwrap();
        assert_eq!(&stored[..], b"overlay");
        assert!(db.get("missing").unwrap().is_none());
    }

    #[test]
    fn open_store_from_spec() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&StoreSpec::Directory(dir.path().to_path_buf())).unwrap();
        assert!(store.upload(b"1", "k/v.png").is_ok());
    }
}
