use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque identifier of a commit in the version control system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines and commit messages
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// New state of one file in a patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum FileEdit {
    Write(String),
    Delete,
}

impl FileEdit {
    pub fn content(&self) -> Option<&str> {
        match self {
            FileEdit::Write(content) => Some(content),
            FileEdit::Delete => None,
        }
    }
}

/// Whole-file edits keyed by repository path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub files: BTreeMap<String, FileEdit>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, path: impl Into<String>, content: impl Into<String>) -> &mut Self {
        self.files.insert(path.into(), FileEdit::Write(content.into()));
        self
    }

    pub fn delete(&mut self, path: impl Into<String>) -> &mut Self {
        self.files.insert(path.into(), FileEdit::Delete);
        self
    }

    pub fn get(&self, path: &str) -> Option<&FileEdit> {
        self.files.get(path)
    }

    pub fn paths(&self) -> BTreeSet<String> {
        self.files.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Apply `other` on top of this patch; its edits win
    pub fn overlay(&mut self, other: &Patch) {
        for (path, edit) in &other.files {
            self.files.insert(path.clone(), edit.clone());
        }
    }

    pub fn overlaid(&self, other: &Patch) -> Patch {
        let mut merged = self.clone();
        merged.overlay(other);
        merged
    }

    /// Copy of this patch restricted to the given paths
    pub fn only(&self, paths: &BTreeSet<String>) -> Patch {
        Patch {
            files: self
                .files
                .iter()
                .filter(|(path, _)| paths.contains(*path))
                .map(|(path, edit)| (path.clone(), edit.clone()))
                .collect(),
        }
    }

    /// Copy of this patch without the given paths
    pub fn without(&self, paths: &BTreeSet<String>) -> Patch {
        Patch {
            files: self
                .files
                .iter()
                .filter(|(path, _)| !paths.contains(*path))
                .map(|(path, edit)| (path.clone(), edit.clone()))
                .collect(),
        }
    }

    /// Every (path, line) pair written by the patch
    pub fn line_set(&self) -> BTreeSet<(String, String)> {
        let mut lines = BTreeSet::new();
        for (path, edit) in &self.files {
            match edit {
                FileEdit::Write(content) => {
                    for line in content.lines() {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            lines.insert((path.clone(), trimmed.to_string()));
                        }
                    }
                }
                FileEdit::Delete => {
                    lines.insert((path.clone(), "<deleted>".to_string()));
                }
            }
        }
        lines
    }

    /// Jaccard similarity of the written lines
    pub fn similarity(&self, other: &Patch) -> f64 {
        let left = self.line_set();
        let right = other.line_set();
        if left.is_empty() && right.is_empty() {
            return 1.0;
        }
        let shared = left.intersection(&right).count() as f64;
        let union = left.union(&right).count() as f64;
        shared / union
    }
}

/// Result of a three-way merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Commit holding the merged tree, when the merge was clean
    pub merged: Option<Revision>,
    /// Paths the merge could not reconcile
    pub conflicts: Vec<String>,
}

impl MergeOutcome {
    pub fn clean(revision: Revision) -> Self {
        Self {
            merged: Some(revision),
            conflicts: Vec::new(),
        }
    }

    pub fn conflicted(conflicts: Vec<String>) -> Self {
        Self {
            merged: None,
            conflicts,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.merged.is_some() && self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: Revision,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}
