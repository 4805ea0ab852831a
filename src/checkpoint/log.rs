use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::store::StoreError;

/// Append-only JSON-lines file. One record per line, never rewritten.
#[derive(Debug)]
pub struct JsonlLog<T> {
    path: PathBuf,
    write: Mutex<()>,
    _records: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
            _records: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &T) -> Result<(), StoreError> {
        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Every record in append order. A torn final line from an interrupted
    /// append is skipped; corruption anywhere else is an error.
    pub async fn read_all(&self) -> Result<Vec<T>, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).await?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(_) if index + 1 == lines.len() && !content.ends_with('\n') => {
                    tracing::warn!(path = %self.path.display(), "Skipping torn final log line");
                }
                Err(e) => {
                    return Err(StoreError::Corrupted {
                        path: self.path.display().to_string(),
                        reason: format!("line {}: {e}", index + 1),
                    })
                }
            }
        }
        Ok(records)
    }
}
