//! Version control abstraction
//!
//! Everything the steward does to repository history goes through
//! [`VersionControl`], so the pipeline can be exercised against an
//! in-memory repository in tests and against git2 in production.

mod git2_vcs;
mod types;

pub use git2_vcs::Git2Vcs;
pub use types::{CommitInfo, FileEdit, MergeOutcome, Patch, Revision};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("revision not found: {0}")]
    NotFound(String),

    #[error("branch '{branch}' moved: expected {expected}, found {actual}")]
    BaseMoved {
        branch: String,
        expected: Revision,
        actual: Revision,
    },

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("version control operation failed: {0}")]
    Other(String),
}

/// Operations the steward needs from the version control system
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Resolve a branch name or revision string to a commit
    async fn resolve(&self, reference: &str) -> Result<Revision, VcsError>;

    async fn changed_files(&self, base: &Revision, head: &Revision) -> Result<BTreeSet<String>, VcsError>;

    /// Whole-file patch turning `base` into `head`
    async fn diff(&self, base: &Revision, head: &Revision) -> Result<Patch, VcsError>;

    async fn read_file(&self, revision: &Revision, path: &str) -> Result<Option<String>, VcsError>;

    /// Merge `theirs` into `ours` with `base` as common ancestor.
    /// A clean merge yields a new commit whose only parent is `ours`.
    async fn merge_three(&self, base: &Revision, ours: &Revision, theirs: &Revision) -> Result<MergeOutcome, VcsError>;

    async fn commit_patch(&self, parent: &Revision, patch: &Patch, message: &str) -> Result<Revision, VcsError>;

    /// Move `branch` to `new` only if it still points at `expected`
    async fn compare_and_swap(&self, branch: &str, expected: &Revision, new: &Revision) -> Result<(), VcsError>;

    async fn create_branch(&self, name: &str, at: &Revision) -> Result<(), VcsError>;

    async fn delete_branch(&self, name: &str) -> Result<(), VcsError>;

    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>, VcsError>;

    /// Commits reachable from `head` but not from `base`, oldest first
    async fn commits_between(&self, base: &Revision, head: &Revision) -> Result<Vec<CommitInfo>, VcsError>;

    async fn commit_info(&self, revision: &Revision) -> Result<CommitInfo, VcsError>;

    async fn parent(&self, revision: &Revision) -> Result<Option<Revision>, VcsError>;

    async fn merge_base(&self, a: &Revision, b: &Revision) -> Result<Revision, VcsError>;

    async fn is_ancestor(&self, ancestor: &Revision, descendant: &Revision) -> Result<bool, VcsError>;

    /// Write the tree of `revision` into `target`
    async fn materialize(&self, revision: &Revision, target: &Path) -> Result<(), VcsError>;
}

/// Merge several heads onto `base` one after another.
/// Conflicting heads are skipped and their conflicted paths reported.
pub async fn merge_all(
    vcs: &dyn VersionControl,
    base: &Revision,
    heads: &[Revision],
) -> Result<MergeOutcome, VcsError> {
    let mut current = base.clone();
    let mut conflicts = BTreeSet::new();

    for head in heads {
        if vcs.is_ancestor(head, &current).await? {
            continue;
        }
        let ancestor = vcs.merge_base(&current, head).await?;
        let outcome = vcs.merge_three(&ancestor, &current, head).await?;
        match outcome.merged {
            Some(merged) if outcome.conflicts.is_empty() => current = merged,
            _ => conflicts.extend(outcome.conflicts),
        }
    }

    if conflicts.is_empty() {
        Ok(MergeOutcome::clean(current))
    } else {
        Ok(MergeOutcome::conflicted(conflicts.into_iter().collect()))
    }
}
