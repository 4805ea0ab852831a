// In-memory repository with whole-file three-way merges. No side effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::vcs::{CommitInfo, FileEdit, MergeOutcome, Patch, Revision, VcsError, VersionControl};

type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Snapshot {
    files: Tree,
    parent: Option<Revision>,
    message: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Repo {
    commits: HashMap<Revision, Snapshot>,
    branches: BTreeMap<String, Revision>,
    next: u64,
}

impl Repo {
    fn snapshot(&self, revision: &Revision) -> Result<&Snapshot, VcsError> {
        self.commits
            .get(revision)
            .ok_or_else(|| VcsError::NotFound(revision.to_string()))
    }

    fn store(&mut self, files: Tree, parent: Option<Revision>, message: &str, timestamp: DateTime<Utc>) -> Revision {
        self.next += 1;
        let revision = Revision::new(format!("m{:07}", self.next));
        self.commits.insert(
            revision.clone(),
            Snapshot {
                files,
                parent,
                message: message.to_string(),
                timestamp,
            },
        );
        revision
    }

    fn ancestors(&self, revision: &Revision) -> Vec<Revision> {
        let mut chain = Vec::new();
        let mut current = Some(revision.clone());
        while let Some(rev) = current {
            current = self.commits.get(&rev).and_then(|s| s.parent.clone());
            chain.push(rev);
        }
        chain
    }
}

#[derive(Debug, Default)]
pub struct MemoryVcs {
    repo: Mutex<Repo>,
    pub executed: Mutex<Vec<String>>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo(&self) -> std::sync::MutexGuard<'_, Repo> {
        self.repo.lock().unwrap()
    }

    fn record(&self, operation: String) {
        self.executed.lock().unwrap().push(operation);
    }

    /// Create the root commit and point `main` at it
    pub fn root(&self, files: &[(&str, &str)]) -> Revision {
        let tree = files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect();
        let mut repo = self.repo();
        let revision = repo.store(tree, None, "root", Utc::now());
        repo.branches.insert("main".to_string(), revision.clone());
        revision
    }

    pub fn branch_from(&self, name: &str, at: &Revision) {
        self.repo().branches.insert(name.to_string(), at.clone());
    }

    pub fn set_branch(&self, name: &str, at: &Revision) {
        self.branch_from(name, at);
    }

    pub fn head(&self, branch: &str) -> Revision {
        self.repo().branches.get(branch).cloned().expect("branch exists")
    }

    pub fn commit_on(&self, branch: &str, edits: &[(&str, Option<&str>)], message: &str) -> Revision {
        self.commit_on_at(branch, edits, message, Utc::now())
    }

    /// Commit whole-file edits on top of `branch` and advance it
    pub fn commit_on_at(
        &self,
        branch: &str,
        edits: &[(&str, Option<&str>)],
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Revision {
        let mut repo = self.repo();
        let parent = repo.branches.get(branch).cloned().expect("branch exists");
        let mut files = repo.commits[&parent].files.clone();
        for (path, content) in edits {
            match content {
                Some(content) => files.insert(path.to_string(), content.to_string()),
                None => files.remove(*path),
            };
        }
        let revision = repo.store(files, Some(parent), message, timestamp);
        repo.branches.insert(branch.to_string(), revision.clone());
        revision
    }

    pub fn files_at(&self, revision: &Revision) -> Tree {
        self.repo().commits[revision].files.clone()
    }

    pub fn file_at(&self, revision: &Revision, path: &str) -> Option<String> {
        self.repo().commits.get(revision).and_then(|s| s.files.get(path).cloned())
    }

    pub fn operations(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl VersionControl for MemoryVcs {
    async fn resolve(&self, reference: &str) -> Result<Revision, VcsError> {
        let repo = self.repo();
        if let Some(revision) = repo.branches.get(reference) {
            return Ok(revision.clone());
        }
        let revision = Revision::new(reference);
        if repo.commits.contains_key(&revision) {
            Ok(revision)
        } else {
            Err(VcsError::NotFound(reference.to_string()))
        }
    }

    async fn changed_files(&self, base: &Revision, head: &Revision) -> Result<BTreeSet<String>, VcsError> {
        Ok(self.diff(base, head).await?.paths())
    }

    async fn diff(&self, base: &Revision, head: &Revision) -> Result<Patch, VcsError> {
        let repo = self.repo();
        let before = &repo.snapshot(base)?.files;
        let after = &repo.snapshot(head)?.files;
        let mut patch = Patch::new();
        for (path, content) in after {
            if before.get(path) != Some(content) {
                patch.write(path.clone(), content.clone());
            }
        }
        for path in before.keys() {
            if !after.contains_key(path) {
                patch.delete(path.clone());
            }
        }
        Ok(patch)
    }

    async fn read_file(&self, revision: &Revision, path: &str) -> Result<Option<String>, VcsError> {
        Ok(self.repo().snapshot(revision)?.files.get(path).cloned())
    }

    async fn merge_three(&self, base: &Revision, ours: &Revision, theirs: &Revision) -> Result<MergeOutcome, VcsError> {
        self.record(format!("merge {} {}", ours, theirs));
        let mut repo = self.repo();
        let b = repo.snapshot(base)?.files.clone();
        let o = repo.snapshot(ours)?.files.clone();
        let t = repo.snapshot(theirs)?.files.clone();

        let paths: BTreeSet<&String> = b.keys().chain(o.keys()).chain(t.keys()).collect();
        let mut merged = Tree::new();
        let mut conflicts = Vec::new();
        for path in paths {
            let (bv, ov, tv) = (b.get(path), o.get(path), t.get(path));
            let pick = if ov == tv {
                ov
            } else if ov == bv {
                tv
            } else if tv == bv {
                ov
            } else {
                conflicts.push(path.clone());
                continue;
            };
            if let Some(content) = pick {
                merged.insert(path.clone(), content.clone());
            }
        }

        if !conflicts.is_empty() {
            return Ok(MergeOutcome::conflicted(conflicts));
        }
        let message = format!("Merge {} onto {}", theirs.short(), ours.short());
        let revision = repo.store(merged, Some(ours.clone()), &message, Utc::now());
        Ok(MergeOutcome::clean(revision))
    }

    async fn commit_patch(&self, parent: &Revision, patch: &Patch, message: &str) -> Result<Revision, VcsError> {
        let mut repo = self.repo();
        let mut files = repo.snapshot(parent)?.files.clone();
        for (path, edit) in &patch.files {
            match edit {
                FileEdit::Write(content) => {
                    files.insert(path.clone(), content.clone());
                }
                FileEdit::Delete => {
                    files.remove(path);
                }
            }
        }
        Ok(repo.store(files, Some(parent.clone()), message, Utc::now()))
    }

    async fn compare_and_swap(&self, branch: &str, expected: &Revision, new: &Revision) -> Result<(), VcsError> {
        self.record(format!("cas {branch} {expected} {new}"));
        let mut repo = self.repo();
        let current = repo
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| VcsError::NotFound(branch.to_string()))?;
        if &current != expected {
            return Err(VcsError::BaseMoved {
                branch: branch.to_string(),
                expected: expected.clone(),
                actual: current,
            });
        }
        repo.branches.insert(branch.to_string(), new.clone());
        Ok(())
    }

    async fn create_branch(&self, name: &str, at: &Revision) -> Result<(), VcsError> {
        self.repo().branches.insert(name.to_string(), at.clone());
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<(), VcsError> {
        self.repo()
            .branches
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VcsError::NotFound(name.to_string()))
    }

    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>, VcsError> {
        Ok(self
            .repo()
            .branches
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn commits_between(&self, base: &Revision, head: &Revision) -> Result<Vec<CommitInfo>, VcsError> {
        let repo = self.repo();
        let hidden: BTreeSet<Revision> = repo.ancestors(base).into_iter().collect();
        let mut commits = Vec::new();
        for revision in repo.ancestors(head) {
            if hidden.contains(&revision) {
                break;
            }
            let snapshot = repo.snapshot(&revision)?;
            commits.push(CommitInfo {
                id: revision.clone(),
                message: snapshot.message.clone(),
                author: "worker".to_string(),
                timestamp: snapshot.timestamp,
            });
        }
        commits.reverse();
        Ok(commits)
    }

    async fn commit_info(&self, revision: &Revision) -> Result<CommitInfo, VcsError> {
        let repo = self.repo();
        let snapshot = repo.snapshot(revision)?;
        Ok(CommitInfo {
            id: revision.clone(),
            message: snapshot.message.clone(),
            author: "worker".to_string(),
            timestamp: snapshot.timestamp,
        })
    }

    async fn parent(&self, revision: &Revision) -> Result<Option<Revision>, VcsError> {
        Ok(self.repo().snapshot(revision)?.parent.clone())
    }

    async fn merge_base(&self, a: &Revision, b: &Revision) -> Result<Revision, VcsError> {
        let repo = self.repo();
        let left: BTreeSet<Revision> = repo.ancestors(a).into_iter().collect();
        repo.ancestors(b)
            .into_iter()
            .find(|rev| left.contains(rev))
            .ok_or_else(|| VcsError::Other(format!("no common ancestor of {a} and {b}")))
    }

    async fn is_ancestor(&self, ancestor: &Revision, descendant: &Revision) -> Result<bool, VcsError> {
        Ok(self.repo().ancestors(descendant).contains(ancestor))
    }

    async fn materialize(&self, revision: &Revision, target: &Path) -> Result<(), VcsError> {
        let files = self.repo().snapshot(revision)?.files.clone();
        for (path, content) in files {
            let full = target.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(full, content)?;
        }
        Ok(())
    }
}
