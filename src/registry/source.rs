use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

use crate::vcs::{VcsError, VersionControl};

use super::types::ChangeSetHint;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discovers in-flight change sets
#[async_trait]
pub trait ChangeSetSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<ChangeSetHint>, SourceError>;
}

/// Worker branches under a prefix, with optional JSON hint files
/// named after the branch (`agent/one` reads `agent__one.json`).
pub struct GitBranchSource {
    vcs: Arc<dyn VersionControl>,
    prefix: String,
    hints_dir: PathBuf,
}

impl GitBranchSource {
    pub fn new(vcs: Arc<dyn VersionControl>, prefix: impl Into<String>, hints_dir: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            prefix: prefix.into(),
            hints_dir: hints_dir.into(),
        }
    }

    fn hint_path(&self, branch: &str) -> PathBuf {
        self.hints_dir.join(format!("{}.json", branch.replace('/', "__")))
    }

    async fn load_hint(&self, branch: &str) -> Result<ChangeSetHint, SourceError> {
        let path = self.hint_path(branch);
        if !fs::try_exists(&path).await? {
            return Ok(ChangeSetHint::for_branch(branch));
        }
        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<ChangeSetHint>(&content) {
            Ok(mut hint) => {
                hint.branch = branch.to_string();
                Ok(hint)
            }
            Err(e) => {
                warn!(branch = branch, error = %e, "Ignoring unreadable hint file");
                Ok(ChangeSetHint::for_branch(branch))
            }
        }
    }
}

#[async_trait]
impl ChangeSetSource for GitBranchSource {
    async fn discover(&self) -> Result<Vec<ChangeSetHint>, SourceError> {
        let branches = self.vcs.list_branches(&self.prefix).await?;
        let mut hints = Vec::with_capacity(branches.len());
        for branch in branches {
            hints.push(self.load_hint(&branch).await?);
        }
        Ok(hints)
    }
}
