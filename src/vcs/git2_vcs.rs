use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, Delta, ErrorCode, Index, IndexEntry, IndexTime, Oid, Repository, Signature, Sort,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{CommitInfo, FileEdit, MergeOutcome, Patch, Revision, VcsError, VersionControl};

/// [`VersionControl`] backed by a local git repository
pub struct Git2Vcs {
    repo: Mutex<Repository>,
}

impl Git2Vcs {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VcsError> {
        let repo = Repository::open(path)?;
        Ok(Self::from_repository(repo))
    }

    pub fn from_repository(repo: Repository) -> Self {
        Self {
            repo: Mutex::new(repo),
        }
    }

    fn with_repo<T>(&self, f: impl FnOnce(&Repository) -> Result<T, VcsError>) -> Result<T, VcsError> {
        let repo = self
            .repo
            .lock()
            .map_err(|_| VcsError::Other("repository lock poisoned".to_string()))?;
        f(&repo)
    }

    fn oid(revision: &Revision) -> Result<Oid, VcsError> {
        Oid::from_str(revision.as_str()).map_err(|_| VcsError::NotFound(revision.to_string()))
    }

    fn find_commit<'r>(repo: &'r Repository, revision: &Revision) -> Result<Commit<'r>, VcsError> {
        let oid = Self::oid(revision)?;
        repo.find_commit(oid).map_err(|e| match e.code() {
            ErrorCode::NotFound => VcsError::NotFound(revision.to_string()),
            _ => VcsError::Git(e),
        })
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>, VcsError> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now("merge-steward", "steward@localhost")?),
        }
    }

    fn index_entry(path: &str, id: Oid, size: usize) -> IndexEntry {
        IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: size as u32,
            id,
            flags: 0,
            flags_extended: 0,
            path: path.as_bytes().to_vec(),
        }
    }

    fn blob_text(repo: &Repository, id: Oid) -> Result<String, VcsError> {
        let blob = repo.find_blob(id)?;
        Ok(String::from_utf8_lossy(blob.content()).into_owned())
    }

    fn info(commit: &Commit<'_>) -> CommitInfo {
        let timestamp = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        CommitInfo {
            id: Revision::new(commit.id().to_string()),
            message: commit.message().unwrap_or_default().to_string(),
            author: commit.author().name().unwrap_or("unknown").to_string(),
            timestamp,
        }
    }
}

#[async_trait]
impl VersionControl for Git2Vcs {
    async fn resolve(&self, reference: &str) -> Result<Revision, VcsError> {
        self.with_repo(|repo| {
            let object = repo
                .revparse_single(reference)
                .map_err(|_| VcsError::NotFound(reference.to_string()))?;
            let commit = object.peel_to_commit()?;
            Ok(Revision::new(commit.id().to_string()))
        })
    }

    async fn changed_files(&self, base: &Revision, head: &Revision) -> Result<BTreeSet<String>, VcsError> {
        self.with_repo(|repo| {
            let old_tree = Self::find_commit(repo, base)?.tree()?;
            let new_tree = Self::find_commit(repo, head)?.tree()?;
            let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

            let mut files = BTreeSet::new();
            for delta in diff.deltas() {
                for path in [delta.old_file().path(), delta.new_file().path()].into_iter().flatten() {
                    files.insert(path.to_string_lossy().into_owned());
                }
            }
            Ok(files)
        })
    }

    async fn diff(&self, base: &Revision, head: &Revision) -> Result<Patch, VcsError> {
        self.with_repo(|repo| {
            let old_tree = Self::find_commit(repo, base)?.tree()?;
            let new_tree = Self::find_commit(repo, head)?.tree()?;
            let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

            let mut patch = Patch::new();
            for delta in diff.deltas() {
                match delta.status() {
                    Delta::Deleted => {
                        if let Some(path) = delta.old_file().path() {
                            patch.delete(path.to_string_lossy());
                        }
                    }
                    _ => {
                        if let Some(path) = delta.new_file().path() {
                            let content = Self::blob_text(repo, delta.new_file().id())?;
                            patch.write(path.to_string_lossy(), content);
                        }
                    }
                }
            }
            Ok(patch)
        })
    }

    async fn read_file(&self, revision: &Revision, path: &str) -> Result<Option<String>, VcsError> {
        self.with_repo(|repo| {
            let tree = Self::find_commit(repo, revision)?.tree()?;
            let entry = match tree.get_path(Path::new(path)) {
                Ok(entry) => entry,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let object = entry.to_object(repo)?;
            Ok(object
                .as_blob()
                .map(|blob| String::from_utf8_lossy(blob.content()).into_owned()))
        })
    }

    async fn merge_three(&self, base: &Revision, ours: &Revision, theirs: &Revision) -> Result<MergeOutcome, VcsError> {
        self.with_repo(|repo| {
            let ancestor = Self::find_commit(repo, base)?.tree()?;
            let our_commit = Self::find_commit(repo, ours)?;
            let their_commit = Self::find_commit(repo, theirs)?;

            let mut index = repo.merge_trees(&ancestor, &our_commit.tree()?, &their_commit.tree()?, None)?;
            if index.has_conflicts() {
                let mut conflicts = BTreeSet::new();
                for conflict in index.conflicts()? {
                    let conflict = conflict?;
                    if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                        conflicts.insert(String::from_utf8_lossy(&entry.path).into_owned());
                    }
                }
                debug!(ours = %ours.short(), theirs = %theirs.short(), conflicts = conflicts.len(), "Merge conflicted");
                return Ok(MergeOutcome::conflicted(conflicts.into_iter().collect()));
            }

            let tree_id = index.write_tree_to(repo)?;
            let tree = repo.find_tree(tree_id)?;
            let signature = Self::signature(repo)?;
            let message = format!("Merge {} onto {}", theirs.short(), ours.short());
            let oid = repo.commit(None, &signature, &signature, &message, &tree, &[&our_commit])?;
            Ok(MergeOutcome::clean(Revision::new(oid.to_string())))
        })
    }

    async fn commit_patch(&self, parent: &Revision, patch: &Patch, message: &str) -> Result<Revision, VcsError> {
        self.with_repo(|repo| {
            let parent_commit = Self::find_commit(repo, parent)?;
            let mut index = Index::new()?;
            index.read_tree(&parent_commit.tree()?)?;

            for (path, edit) in &patch.files {
                match edit {
                    FileEdit::Write(content) => {
                        let blob = repo.blob(content.as_bytes())?;
                        index.add(&Self::index_entry(path, blob, content.len()))?;
                    }
                    FileEdit::Delete => {
                        if index.get_path(Path::new(path), 0).is_some() {
                            index.remove_path(Path::new(path))?;
                        }
                    }
                }
            }

            let tree_id = index.write_tree_to(repo)?;
            let tree = repo.find_tree(tree_id)?;
            let signature = Self::signature(repo)?;
            let oid = repo.commit(None, &signature, &signature, message, &tree, &[&parent_commit])?;
            Ok(Revision::new(oid.to_string()))
        })
    }

    async fn compare_and_swap(&self, branch: &str, expected: &Revision, new: &Revision) -> Result<(), VcsError> {
        self.with_repo(|repo| {
            let refname = format!("refs/heads/{branch}");
            let expected_oid = Self::oid(expected)?;
            let new_oid = Self::oid(new)?;
            let current = repo.refname_to_id(&refname)?;
            if current != expected_oid {
                return Err(VcsError::BaseMoved {
                    branch: branch.to_string(),
                    expected: expected.clone(),
                    actual: Revision::new(current.to_string()),
                });
            }

            let log_message = format!("merge-steward: advance {branch} to {}", new.short());
            match repo.reference_matching(&refname, new_oid, true, expected_oid, &log_message) {
                Ok(_) => Ok(()),
                Err(e) if e.code() == ErrorCode::Modified => {
                    let actual = repo.refname_to_id(&refname)?;
                    Err(VcsError::BaseMoved {
                        branch: branch.to_string(),
                        expected: expected.clone(),
                        actual: Revision::new(actual.to_string()),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn create_branch(&self, name: &str, at: &Revision) -> Result<(), VcsError> {
        self.with_repo(|repo| {
            let commit = Self::find_commit(repo, at)?;
            repo.branch(name, &commit, true)?;
            Ok(())
        })
    }

    async fn delete_branch(&self, name: &str) -> Result<(), VcsError> {
        self.with_repo(|repo| {
            let mut branch = repo
                .find_branch(name, BranchType::Local)
                .map_err(|_| VcsError::NotFound(name.to_string()))?;
            branch.delete()?;
            Ok(())
        })
    }

    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>, VcsError> {
        self.with_repo(|repo| {
            let mut names = Vec::new();
            for item in repo.branches(Some(BranchType::Local))? {
                let (branch, _) = item?;
                if let Some(name) = branch.name()? {
                    if name.starts_with(prefix) {
                        names.push(name.to_string());
                    }
                }
            }
            names.sort();
            Ok(names)
        })
    }

    async fn commits_between(&self, base: &Revision, head: &Revision) -> Result<Vec<CommitInfo>, VcsError> {
        self.with_repo(|repo| {
            let mut walk = repo.revwalk()?;
            walk.push(Self::oid(head)?)?;
            walk.hide(Self::oid(base)?)?;
            walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;

            let mut commits = Vec::new();
            for oid in walk {
                let commit = repo.find_commit(oid?)?;
                commits.push(Self::info(&commit));
            }
            Ok(commits)
        })
    }

    async fn commit_info(&self, revision: &Revision) -> Result<CommitInfo, VcsError> {
        self.with_repo(|repo| Ok(Self::info(&Self::find_commit(repo, revision)?)))
    }

    async fn parent(&self, revision: &Revision) -> Result<Option<Revision>, VcsError> {
        self.with_repo(|repo| {
            let commit = Self::find_commit(repo, revision)?;
            Ok(commit.parent_id(0).ok().map(|oid| Revision::new(oid.to_string())))
        })
    }

    async fn merge_base(&self, a: &Revision, b: &Revision) -> Result<Revision, VcsError> {
        self.with_repo(|repo| {
            let oid = repo.merge_base(Self::oid(a)?, Self::oid(b)?)?;
            Ok(Revision::new(oid.to_string()))
        })
    }

    async fn is_ancestor(&self, ancestor: &Revision, descendant: &Revision) -> Result<bool, VcsError> {
        if ancestor == descendant {
            return Ok(true);
        }
        self.with_repo(|repo| {
            Ok(repo.graph_descendant_of(Self::oid(descendant)?, Self::oid(ancestor)?)?)
        })
    }

    async fn materialize(&self, revision: &Revision, target: &Path) -> Result<(), VcsError> {
        std::fs::create_dir_all(target)?;
        self.with_repo(|repo| {
            let tree = Self::find_commit(repo, revision)?.tree()?;
            let mut checkout = CheckoutBuilder::new();
            checkout
                .target_dir(target)
                .force()
                .recreate_missing(true)
                .update_index(false);
            repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;
            Ok(())
        })
    }
}
