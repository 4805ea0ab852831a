//! Checkpoints, provenance and rollback
//!
//! A checkpoint names a known-good integration revision. One is taken before
//! every queue commit and at every wave boundary. Reverts never rewrite
//! history: they are new commits delivered through the merge queue.

mod log;
mod provenance;

pub use log::JsonlLog;
pub use provenance::{Delivery, DeliveryKind, ProvenanceMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::budget::BudgetController;
use crate::registry::ChangeSetId;
use crate::store::{operation_key, StoreError};
use crate::vcs::{Patch, Revision, VcsError, VersionControl};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint prefix '{0}' is ambiguous")]
    Ambiguous(String),

    #[error("change set {0} is not live on the integration branch")]
    NotDelivered(ChangeSetId),

    #[error("integration branch is already at {0}")]
    NothingToRevert(Revision),

    #[error("version control error: {0}")]
    Vcs(#[from] VcsError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointReason {
    BeforeCommit { entry: String },
    WaveBoundary { wave: usize },
    Manual,
}

impl CheckpointReason {
    fn scope(&self) -> String {
        match self {
            CheckpointReason::BeforeCommit { entry } => format!("before-commit:{entry}"),
            CheckpointReason::WaveBoundary { wave } => format!("wave:{wave}"),
            CheckpointReason::Manual => "manual".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub revision: Revision,
    /// Change sets live at `revision`
    pub change_sets: Vec<ChangeSetId>,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackTarget {
    Checkpoint { id: String },
    ChangeSet { id: ChangeSetId },
}

/// A forward revert waiting to be delivered by the merge queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub key: String,
    pub target: RollbackTarget,
    /// Integration head the revert was computed against
    pub base: Revision,
    pub revision: Revision,
    pub reverts: Vec<ChangeSetId>,
    pub description: String,
}

/// Outcome of planning the revert of a single change set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectiveRevert {
    /// The inverse applies cleanly on the current head
    Clean(RollbackRequest),
    /// Later work touched the same files. The inverse commit sits on `branch`
    /// and has to be resolved like any other change set.
    Conflicted {
        change_set: ChangeSetId,
        branch: String,
        revision: Revision,
        files: Vec<String>,
    },
}

pub struct CheckpointManager {
    vcs: Arc<dyn VersionControl>,
    budget: Arc<BudgetController>,
    integration_branch: String,
    checkpoints: JsonlLog<Checkpoint>,
    deliveries: JsonlLog<Delivery>,
    provenance: RwLock<ProvenanceMap>,
}

impl CheckpointManager {
    /// Open the logs under `state_dir` and rebuild provenance from them
    pub async fn open(
        vcs: Arc<dyn VersionControl>,
        budget: Arc<BudgetController>,
        integration_branch: impl Into<String>,
        state_dir: &Path,
    ) -> Result<Self, CheckpointError> {
        let checkpoints = JsonlLog::new(state_dir.join("checkpoints.jsonl"));
        let deliveries = JsonlLog::new(state_dir.join("deliveries.jsonl"));
        let provenance = ProvenanceMap::from_deliveries(deliveries.read_all().await?);
        debug!(deliveries = provenance.deliveries().len(), "Provenance loaded");
        Ok(Self {
            vcs,
            budget,
            integration_branch: integration_branch.into(),
            checkpoints,
            deliveries,
            provenance: RwLock::new(provenance),
        })
    }

    pub fn integration_branch(&self) -> &str {
        &self.integration_branch
    }

    /// Record `revision` as known-good. Retrying with the same reason and
    /// revision returns the existing checkpoint.
    pub async fn checkpoint(&self, revision: &Revision, reason: CheckpointReason) -> Result<Checkpoint, CheckpointError> {
        let id = operation_key(&reason.scope(), [revision]);
        if let Some(existing) = self.checkpoints.read_all().await?.into_iter().find(|c| c.id == id) {
            return Ok(existing);
        }
        let checkpoint = Checkpoint {
            id,
            revision: revision.clone(),
            change_sets: self.provenance.read().await.active_change_sets(),
            reason,
            created_at: Utc::now(),
        };
        self.checkpoints.append(&checkpoint).await?;
        info!(checkpoint = %checkpoint.id, revision = %revision.short(), "Checkpoint recorded");
        Ok(checkpoint)
    }

    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read_all().await?)
    }

    /// Find a checkpoint by id or unique id prefix
    pub async fn find(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        let mut matches: Vec<Checkpoint> = self
            .checkpoints()
            .await?
            .into_iter()
            .filter(|c| c.id.starts_with(id))
            .collect();
        matches.dedup_by(|a, b| a.id == b.id);
        match matches.len() {
            0 => Err(CheckpointError::NotFound(id.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(CheckpointError::Ambiguous(id.to_string())),
        }
    }

    /// Remember what a queue commit carried. False when already recorded.
    pub async fn record_delivery(&self, delivery: Delivery) -> Result<bool, CheckpointError> {
        let mut provenance = self.provenance.write().await;
        if provenance.at(&delivery.revision).is_some() {
            return Ok(false);
        }
        self.deliveries.append(&delivery).await?;
        if let DeliveryKind::Rollback { reverts } = &delivery.kind {
            warn!(revision = %delivery.revision.short(), reverted = ?reverts, "Rollback delivered");
            self.budget.record_rollback();
        }
        provenance.insert(delivery);
        Ok(true)
    }

    pub async fn provenance(&self) -> ProvenanceMap {
        self.provenance.read().await.clone()
    }

    pub async fn is_delivered(&self, id: &ChangeSetId, head: &Revision) -> bool {
        self.provenance.read().await.is_delivered(id, head)
    }

    /// Forward revert of everything delivered after `checkpoint_id`
    pub async fn plan_revert_to(&self, checkpoint_id: &str) -> Result<RollbackRequest, CheckpointError> {
        let checkpoint = self.find(checkpoint_id).await?;
        let head = self.vcs.resolve(&self.integration_branch).await?;
        if head == checkpoint.revision {
            return Err(CheckpointError::NothingToRevert(head));
        }

        let patch = self.vcs.diff(&head, &checkpoint.revision).await?;
        let description = format!("Revert integration branch to checkpoint {}", short_id(&checkpoint.id));
        let revision = self.vcs.commit_patch(&head, &patch, &description).await?;

        let active = self.provenance.read().await.active_change_sets();
        let reverts: Vec<ChangeSetId> = active
            .into_iter()
            .filter(|id| !checkpoint.change_sets.contains(id))
            .collect();
        info!(
            checkpoint = %checkpoint.id,
            head = %head.short(),
            reverts = reverts.len(),
            "Revert to checkpoint planned"
        );
        Ok(RollbackRequest {
            key: operation_key(&format!("rollback:{}", checkpoint.id), [&head]),
            target: RollbackTarget::Checkpoint { id: checkpoint.id },
            base: head,
            revision,
            reverts,
            description,
        })
    }

    /// Inverse of one delivered change set, applied on the current head
    pub async fn plan_selective_revert(&self, id: &ChangeSetId) -> Result<SelectiveRevert, CheckpointError> {
        let delivery = self
            .provenance
            .read()
            .await
            .latest_delivery_of(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotDelivered(id.clone()))?;
        let Some((_, member_head)) = delivery.members.iter().find(|(member, _)| member == id) else {
            return Err(CheckpointError::NotDelivered(id.clone()));
        };

        // Only the files this change set wrote, restored to the state before delivery
        let fork = self.vcs.merge_base(member_head, &delivery.parent).await?;
        let own = self.vcs.changed_files(&fork, member_head).await?;
        let mut inverse = Patch::new();
        for path in &own {
            match self.vcs.read_file(&delivery.parent, path).await? {
                Some(content) => inverse.write(path.clone(), content),
                None => inverse.delete(path.clone()),
            };
        }
        let description = format!("Revert change set {id}");
        let inverse_revision = self.vcs.commit_patch(&delivery.revision, &inverse, &description).await?;

        let head = self.vcs.resolve(&self.integration_branch).await?;
        let outcome = self.vcs.merge_three(&delivery.revision, &head, &inverse_revision).await?;
        match outcome.merged.filter(|_| outcome.conflicts.is_empty()) {
            Some(merged) => {
                info!(change_set = %id, files = own.len(), "Selective revert applies cleanly");
                Ok(SelectiveRevert::Clean(RollbackRequest {
                    key: operation_key(&format!("revert:{id}"), [&head, &delivery.revision]),
                    target: RollbackTarget::ChangeSet { id: id.clone() },
                    base: head,
                    revision: merged,
                    reverts: vec![id.clone()],
                    description,
                }))
            }
            None => {
                let branch = format!("revert/{id}");
                self.vcs.create_branch(&branch, &inverse_revision).await?;
                warn!(change_set = %id, conflicts = ?outcome.conflicts, %branch, "Selective revert conflicts with later work");
                Ok(SelectiveRevert::Conflicted {
                    change_set: id.clone(),
                    branch,
                    revision: inverse_revision,
                    files: outcome.conflicts,
                })
            }
        }
    }

    /// First delivery after `good` for which `probe` reports a failure.
    /// `None` when the newest delivery still passes.
    pub async fn bisect<F, Fut, E>(&self, good: &Revision, mut probe: F) -> Result<Option<Delivery>, E>
    where
        F: FnMut(Revision) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: From<CheckpointError>,
    {
        let deliveries = self.provenance.read().await.deliveries().to_vec();
        let mut suspects = Vec::new();
        for delivery in deliveries {
            if delivery.revision == *good {
                continue;
            }
            let after = self
                .vcs
                .is_ancestor(good, &delivery.revision)
                .await
                .map_err(|e| E::from(CheckpointError::Vcs(e)))?;
            if after {
                suspects.push(delivery);
            }
        }
        let Some(last) = suspects.last() else {
            return Ok(None);
        };
        if probe(last.revision.clone()).await? {
            return Ok(None);
        }

        // suspects[hi] fails; everything before lo passes
        let (mut lo, mut hi) = (0, suspects.len() - 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if probe(suspects[mid].revision.clone()).await? {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        info!(revision = %suspects[hi].revision.short(), "Bisect found first failing delivery");
        Ok(Some(suspects.swap_remove(hi)))
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterId;
    use crate::config::BudgetConfig;
    use crate::testing::MemoryVcs;

    struct Fixture {
        _dir: tempfile::TempDir,
        vcs: Arc<MemoryVcs>,
        manager: CheckpointManager,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        let budget = Arc::new(BudgetController::new(BudgetConfig::default()));
        let manager = CheckpointManager::open(vcs.clone(), budget, "main", dir.path())
            .await
            .unwrap();
        Fixture { _dir: dir, vcs, manager }
    }

    /// Deliver `branch` by fast-forwarding main to its head
    async fn deliver(f: &Fixture, branch: &str) -> Revision {
        let parent = f.vcs.head("main");
        let head = f.vcs.head(branch);
        f.vcs.set_branch("main", &head);
        f.manager
            .record_delivery(Delivery {
                revision: head.clone(),
                parent,
                entry_key: branch.to_string(),
                kind: DeliveryKind::Resolution {
                    cluster_id: ClusterId::new(branch),
                },
                members: vec![(ChangeSetId::new(branch), head.clone())],
                delivered_at: Utc::now(),
            })
            .await
            .unwrap();
        head
    }

    #[tokio::test]
    async fn test_checkpoint_is_idempotent_per_reason_and_revision() {
        let f = fixture().await;
        let root = f.vcs.root(&[("a.txt", "a\n")]);
        let reason = CheckpointReason::BeforeCommit { entry: "e1".into() };

        let first = f.manager.checkpoint(&root, reason.clone()).await.unwrap();
        let again = f.manager.checkpoint(&root, reason).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(f.manager.checkpoints().await.unwrap().len(), 1);

        f.manager
            .checkpoint(&root, CheckpointReason::WaveBoundary { wave: 0 })
            .await
            .unwrap();
        assert_eq!(f.manager.checkpoints().await.unwrap().len(), 2);
        assert_eq!(f.manager.find(&first.id[..10]).await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_revert_to_checkpoint_restores_the_tree() {
        let f = fixture().await;
        let root = f.vcs.root(&[("a.txt", "a\n")]);
        let checkpoint = f.manager.checkpoint(&root, CheckpointReason::Manual).await.unwrap();
        f.vcs.branch_from("agent/x", &root);
        f.vcs.commit_on("agent/x", &[("a.txt", Some("x\n")), ("new.txt", Some("n\n"))], "x");
        deliver(&f, "agent/x").await;

        let request = f.manager.plan_revert_to(&checkpoint.id).await.unwrap();

        assert_eq!(request.base, f.vcs.head("main"));
        assert_eq!(request.reverts, vec![ChangeSetId::new("agent/x")]);
        assert_eq!(f.vcs.files_at(&request.revision), f.vcs.files_at(&root));
    }

    #[tokio::test]
    async fn test_reverting_to_the_current_head_is_refused() {
        let f = fixture().await;
        let root = f.vcs.root(&[("a.txt", "a\n")]);
        let checkpoint = f.manager.checkpoint(&root, CheckpointReason::Manual).await.unwrap();
        assert!(matches!(
            f.manager.plan_revert_to(&checkpoint.id).await,
            Err(CheckpointError::NothingToRevert(_))
        ));
    }

    #[tokio::test]
    async fn test_selective_revert_keeps_other_work() {
        let f = fixture().await;
        let root = f.vcs.root(&[("a.txt", "a\n"), ("b.txt", "b\n")]);
        f.vcs.branch_from("agent/a", &root);
        f.vcs.commit_on("agent/a", &[("a.txt", Some("a2\n"))], "a");
        let after_a = deliver(&f, "agent/a").await;
        f.vcs.branch_from("agent/b", &after_a);
        f.vcs.commit_on("agent/b", &[("b.txt", Some("b2\n"))], "b");
        deliver(&f, "agent/b").await;

        let SelectiveRevert::Clean(request) = f
            .manager
            .plan_selective_revert(&ChangeSetId::new("agent/a"))
            .await
            .unwrap()
        else {
            panic!("expected a clean revert");
        };

        assert_eq!(f.vcs.file_at(&request.revision, "a.txt").as_deref(), Some("a\n"));
        assert_eq!(f.vcs.file_at(&request.revision, "b.txt").as_deref(), Some("b2\n"));
        assert_eq!(request.reverts, vec![ChangeSetId::new("agent/a")]);
    }

    #[tokio::test]
    async fn test_conflicting_selective_revert_becomes_a_branch() {
        let f = fixture().await;
        let root = f.vcs.root(&[("a.txt", "a\n")]);
        f.vcs.branch_from("agent/a", &root);
        f.vcs.commit_on("agent/a", &[("a.txt", Some("a2\n"))], "a");
        let after_a = deliver(&f, "agent/a").await;
        f.vcs.branch_from("agent/b", &after_a);
        f.vcs.commit_on("agent/b", &[("a.txt", Some("a3\n"))], "b");
        deliver(&f, "agent/b").await;

        match f
            .manager
            .plan_selective_revert(&ChangeSetId::new("agent/a"))
            .await
            .unwrap()
        {
            SelectiveRevert::Conflicted { branch, files, revision, .. } => {
                assert_eq!(branch, "revert/agent/a");
                assert_eq!(files, vec!["a.txt".to_string()]);
                assert_eq!(f.vcs.head(&branch), revision);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rollback_delivery_counts_against_the_breaker() {
        let f = fixture().await;
        let root = f.vcs.root(&[("a.txt", "a\n")]);
        f.vcs.branch_from("agent/a", &root);
        f.vcs.commit_on("agent/a", &[("a.txt", Some("a2\n"))], "a");
        let head = deliver(&f, "agent/a").await;
        let before = crate::observability::pipeline_metrics().get_stats().rollbacks;

        f.manager
            .record_delivery(Delivery {
                revision: Revision::new("revert-commit"),
                parent: head,
                entry_key: "rollback".into(),
                kind: DeliveryKind::Rollback {
                    reverts: vec![ChangeSetId::new("agent/a")],
                },
                members: vec![],
                delivered_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(crate::observability::pipeline_metrics().get_stats().rollbacks > before);
        assert!(f.manager.provenance().await.active_change_sets().is_empty());
    }

    #[tokio::test]
    async fn test_bisect_finds_the_first_failing_delivery() {
        let f = fixture().await;
        let root = f.vcs.root(&[("log.txt", "\n")]);
        let mut current = root.clone();
        let mut delivered = Vec::new();
        for (n, content) in ["one\n", "two\n", "BROKEN\n", "four\n"].iter().enumerate() {
            let branch = format!("agent/{n}");
            let path = format!("f{n}.txt");
            f.vcs.branch_from(&branch, &current);
            f.vcs.commit_on(&branch, &[(path.as_str(), Some(*content))], "work");
            current = deliver(&f, &branch).await;
            delivered.push(current.clone());
        }

        let vcs = f.vcs.clone();
        let culprit = f
            .manager
            .bisect::<_, _, CheckpointError>(&root, |revision| {
                let vcs = vcs.clone();
                async move { Ok(!vcs.files_at(&revision).values().any(|c| c.contains("BROKEN"))) }
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(culprit.revision, delivered[2]);
    }
}
