//! Change-set registry
//!
//! Tracks every in-flight change set and its lifecycle. File lists, symbols
//! and prerequisites come from version control; worker hints only contribute
//! completion signals and declared risk.

mod completion;
mod derive;
mod lifecycle;
mod source;
mod types;

pub use completion::{CompletionAssessment, CompletionDetector, CompletionSignal};
pub use derive::{derive_facts, DeriveError, HeadIndex};
pub use lifecycle::{ChangeSetLifecycle, LifecycleEvent};
pub use source::{ChangeSetSource, GitBranchSource, SourceError};
pub use types::{ChangeSet, ChangeSetHint, ChangeSetId, ChangeSetStatus, DerivedFacts, RiskFlag};

use chrono::{DateTime, Utc};
use statig::blocking::{IntoStateMachineExt, StateMachine};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::classify::severity::RiskTagger;
use crate::vcs::{CommitInfo, VersionControl};

struct RegistryEntry {
    change_set: ChangeSet,
    lifecycle: StateMachine<ChangeSetLifecycle>,
}

impl RegistryEntry {
    fn handle(&mut self, event: LifecycleEvent) {
        self.lifecycle.handle(&event);
        let inner = self.lifecycle.inner();
        self.change_set.status = inner.status();
        self.change_set.completion_score = inner.completion_score;
    }
}

#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    pub discovered: usize,
    pub complete: Vec<ChangeSetId>,
    pub delivered: Vec<ChangeSetId>,
    pub stale: Vec<ChangeSetId>,
    pub unreadable: Vec<(ChangeSetId, String)>,
    pub removed: Vec<ChangeSetId>,
}

pub struct ChangeSetRegistry {
    entries: RwLock<BTreeMap<ChangeSetId, RegistryEntry>>,
    detector: CompletionDetector,
    tagger: RiskTagger,
}

impl ChangeSetRegistry {
    pub fn new(detector: CompletionDetector, tagger: RiskTagger) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            detector,
            tagger,
        }
    }

    pub fn tagger(&self) -> &RiskTagger {
        &self.tagger
    }

    /// Record the latest facts and signals for one change set
    pub async fn observe(
        &self,
        hint: &ChangeSetHint,
        facts: DerivedFacts,
        commits: &[CommitInfo],
        now: DateTime<Utc>,
    ) -> ChangeSetStatus {
        let id = hint.change_set_id();
        let mut entries = self.entries.write().await;

        let entry = entries.entry(id.clone()).or_insert_with(|| {
            debug!(change_set = %id, branch = %hint.branch, "New change set discovered");
            RegistryEntry {
                change_set: ChangeSet {
                    id: id.clone(),
                    branch: hint.branch.clone(),
                    base_revision: facts.base_revision.clone(),
                    head_revision: facts.head_revision.clone(),
                    files_touched: BTreeSet::new(),
                    exported_symbols: BTreeSet::new(),
                    manifest_packages: BTreeSet::new(),
                    prerequisites: BTreeSet::new(),
                    status: ChangeSetStatus::Pending,
                    declared_risk_flags: BTreeSet::new(),
                    derived_risk_flags: BTreeSet::new(),
                    completion_score: 0.0,
                    first_seen: now,
                    last_activity: facts.last_activity,
                },
                lifecycle: ChangeSetLifecycle::new(id.clone()).state_machine(),
            }
        });

        if entry.change_set.head_revision != facts.head_revision {
            entry.handle(LifecycleEvent::Activity);
        }

        let reported: BTreeSet<&String> = hint.reported_files.iter().collect();
        let derived: BTreeSet<&String> = facts.files_touched.iter().collect();
        if !reported.is_empty() && reported != derived {
            debug!(change_set = %id, "Reported file list differs from version control, using derived list");
        }

        let change_set = &mut entry.change_set;
        change_set.branch = hint.branch.clone();
        change_set.base_revision = facts.base_revision;
        change_set.head_revision = facts.head_revision;
        change_set.files_touched = facts.files_touched;
        change_set.exported_symbols = facts.exported_symbols;
        change_set.manifest_packages = facts.manifest_packages;
        change_set.prerequisites = facts.prerequisites;
        change_set.declared_risk_flags = hint.risk_flags.clone();
        change_set.derived_risk_flags = facts.derived_risk_flags;
        change_set.last_activity = facts.last_activity;

        if facts.delivered {
            entry.handle(LifecycleEvent::Resolved);
            return entry.change_set.status;
        }

        let signals = self.detector.collect_signals(hint, commits, facts.last_activity, now);
        let assessment = self.detector.assess(signals, facts.last_activity, now);
        if assessment.stale && entry.change_set.status == ChangeSetStatus::Pending {
            entry.handle(LifecycleEvent::Idle);
        } else {
            entry.handle(LifecycleEvent::Assessed {
                score: assessment.score,
                complete: assessment.complete,
            });
        }
        entry.change_set.status
    }

    /// Re-derive every discovered change set from version control
    pub async fn refresh(
        &self,
        vcs: &dyn VersionControl,
        source: &dyn ChangeSetSource,
        integration_branch: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshReport, SourceError> {
        let hints = source.discover().await?;
        let integration_head = vcs.resolve(integration_branch).await?;

        let mut report = RefreshReport {
            discovered: hints.len(),
            ..Default::default()
        };

        let mut heads = BTreeMap::new();
        let mut readable = Vec::new();
        for hint in hints {
            let id = hint.change_set_id();
            match vcs.resolve(&hint.branch).await {
                Ok(head) => {
                    heads.insert(id, head.clone());
                    readable.push((hint, head));
                }
                Err(e) => {
                    warn!(change_set = %id, error = %e, "Cannot resolve change set head");
                    report.unreadable.push((id, e.to_string()));
                }
            }
        }

        let index = HeadIndex {
            integration_head,
            heads,
        };
        for (hint, head) in &readable {
            let id = hint.change_set_id();
            match derive_facts(vcs, &self.tagger, &index, hint, head).await {
                Ok((facts, commits)) => match self.observe(hint, facts, &commits, now).await {
                    ChangeSetStatus::Complete => report.complete.push(id),
                    ChangeSetStatus::Resolved => report.delivered.push(id),
                    ChangeSetStatus::Stale => report.stale.push(id),
                    _ => {}
                },
                Err(e) => {
                    warn!(change_set = %id, error = %e, "Cannot derive change set facts");
                    report.unreadable.push((id, e.to_string()));
                }
            }
        }

        let known: BTreeSet<ChangeSetId> = index.heads.keys().cloned().collect();
        let mut entries = self.entries.write().await;
        let gone: Vec<ChangeSetId> = entries
            .iter()
            .filter(|(id, entry)| !known.contains(*id) && entry.change_set.status != ChangeSetStatus::Resolved)
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            info!(change_set = %id, "Branch disappeared, dropping change set");
            entries.remove(&id);
            report.removed.push(id);
        }

        Ok(report)
    }

    /// Consistent copy of every tracked change set
    pub async fn snapshot(&self) -> Vec<ChangeSet> {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| entry.change_set.clone())
            .collect()
    }

    /// Complete change sets whose prerequisites are complete or already delivered
    pub async fn eligible(&self) -> Vec<ChangeSet> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| entry.change_set.status == ChangeSetStatus::Complete)
            .filter(|entry| {
                entry.change_set.prerequisites.iter().all(|prereq| {
                    entries.get(prereq).is_some_and(|p| {
                        matches!(p.change_set.status, ChangeSetStatus::Complete | ChangeSetStatus::Resolved)
                    })
                })
            })
            .map(|entry| entry.change_set.clone())
            .collect()
    }

    pub async fn get(&self, id: &ChangeSetId) -> Option<ChangeSet> {
        self.entries.read().await.get(id).map(|e| e.change_set.clone())
    }

    pub async fn insert(&self, change_set: ChangeSet) {
        let id = change_set.id.clone();
        let mut lifecycle = ChangeSetLifecycle::new(id.clone()).state_machine();
        if change_set.status == ChangeSetStatus::Complete {
            lifecycle.handle(&LifecycleEvent::Assessed {
                score: change_set.completion_score,
                complete: true,
            });
        }
        self.entries.write().await.insert(id, RegistryEntry { change_set, lifecycle });
    }

    pub async fn mark_resolved(&self, ids: &[ChangeSetId]) {
        self.apply(ids, LifecycleEvent::Resolved).await;
    }

    pub async fn mark_rolled_back(&self, ids: &[ChangeSetId]) {
        self.apply(ids, LifecycleEvent::RolledBack).await;
    }

    pub async fn mark_failed(&self, ids: &[ChangeSetId], reason: &str) {
        self.apply(
            ids,
            LifecycleEvent::Failed {
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn apply(&self, ids: &[ChangeSetId], event: LifecycleEvent) {
        let mut entries = self.entries.write().await;
        for id in ids {
            match entries.get_mut(id) {
                Some(entry) => entry.handle(event.clone()),
                None => debug!(change_set = %id, "Ignoring lifecycle event for unknown change set"),
            }
        }
    }
}
