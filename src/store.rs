use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::vcs::Revision;

/// Errors that can occur while persisting records
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record corruption detected in {path}: {reason}")]
    Corrupted { path: String, reason: String },
}

/// Kinds of persisted records, one directory each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Cluster,
    Decision,
    QueueEntry,
    /// Queue entries that reached a final status
    QueueArchive,
    QueueMeta,
    Escalation,
}

impl RecordKind {
    fn directory(self) -> &'static str {
        match self {
            RecordKind::Cluster => "clusters",
            RecordKind::Decision => "decisions",
            RecordKind::QueueEntry => "queue",
            RecordKind::QueueArchive => "queue-archive",
            RecordKind::QueueMeta => "queue-meta",
            RecordKind::Escalation => "escalations",
        }
    }
}

/// Deterministic key over ordered parts
pub fn content_key<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Key of a resolution attempt: the cluster plus the exact input revisions
pub fn operation_key<'a>(scope: &str, revisions: impl IntoIterator<Item = &'a Revision>) -> String {
    let mut revisions: Vec<&str> = revisions.into_iter().map(|r| r.as_str()).collect();
    revisions.sort_unstable();
    revisions.dedup();
    let mut parts = vec![scope];
    parts.extend(revisions);
    content_key(&parts)
}

/// JSON-file store for clusters, decisions and queue entries
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        self.root.join(kind.directory()).join(format!("{key}.json"))
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Write a record once. Returns false when the key already exists.
    pub async fn put<T: Serialize>(&self, kind: RecordKind, key: &str, record: &T) -> Result<bool, StoreError> {
        let path = self.record_path(kind, key);
        if fs::try_exists(&path).await? {
            debug!(key = key, "Record already present, skipping write");
            return Ok(false);
        }
        let content = serde_json::to_string_pretty(record)?;
        self.write_atomic(&path, &content).await?;
        Ok(true)
    }

    /// Write or replace a record
    pub async fn upsert<T: Serialize>(&self, kind: RecordKind, key: &str, record: &T) -> Result<(), StoreError> {
        let path = self.record_path(kind, key);
        let content = serde_json::to_string_pretty(record)?;
        self.write_atomic(&path, &content).await
    }

    pub async fn get<T: DeserializeOwned>(&self, kind: RecordKind, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.record_path(kind, key);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupted {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Delete a record. Returns false when there was nothing to delete.
    pub async fn remove(&self, kind: RecordKind, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(kind, key);
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }
        fs::remove_file(&path).await?;
        Ok(true)
    }

    pub async fn list<T: DeserializeOwned>(&self, kind: RecordKind) -> Result<Vec<T>, StoreError> {
        let dir = self.root.join(kind.directory());
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            // Archiving may remove a record between the listing and the read
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            let record = serde_json::from_str(&content).map_err(|e| StoreError::Corrupted {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
