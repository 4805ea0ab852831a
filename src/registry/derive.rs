use std::collections::{BTreeMap, BTreeSet};

use crate::classify::manifest::{self, ManifestError};
use crate::classify::severity::RiskTagger;
use crate::classify::symbols;
use crate::vcs::{CommitInfo, Revision, VcsError, VersionControl};

use super::types::{ChangeSetHint, ChangeSetId, DerivedFacts};

#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Head of every discovered branch, resolved once per refresh
pub struct HeadIndex {
    pub integration_head: Revision,
    pub heads: BTreeMap<ChangeSetId, Revision>,
}

/// Undelivered change sets whose head is an ancestor of `head`,
/// and the nearest of them (the one the others precede).
pub async fn stacked_on(
    vcs: &dyn VersionControl,
    index: &HeadIndex,
    id: &ChangeSetId,
    head: &Revision,
) -> Result<(BTreeSet<ChangeSetId>, Option<Revision>), VcsError> {
    let mut below = Vec::new();
    for (other, other_head) in &index.heads {
        if other == id || other_head == head {
            continue;
        }
        if vcs.is_ancestor(other_head, head).await? && !vcs.is_ancestor(other_head, &index.integration_head).await? {
            below.push((other.clone(), other_head.clone()));
        }
    }

    let mut nearest: Option<Revision> = None;
    for (_, candidate) in &below {
        let nearer = match &nearest {
            None => true,
            Some(current) => vcs.is_ancestor(current, candidate).await?,
        };
        if nearer {
            nearest = Some(candidate.clone());
        }
    }

    Ok((below.into_iter().map(|(id, _)| id).collect(), nearest))
}

/// Derive ground-truth facts for one change set from version control
pub async fn derive_facts(
    vcs: &dyn VersionControl,
    tagger: &RiskTagger,
    index: &HeadIndex,
    hint: &ChangeSetHint,
    head: &Revision,
) -> Result<(DerivedFacts, Vec<CommitInfo>), DeriveError> {
    let id = hint.change_set_id();
    let delivered = vcs.is_ancestor(head, &index.integration_head).await?;

    let (mut prerequisites, nearest) = stacked_on(vcs, index, &id, head).await?;
    prerequisites.extend(hint.depends_on.iter().map(|d| ChangeSetId::new(d.clone())));
    prerequisites.remove(&id);

    let base = match nearest {
        Some(below) => below,
        None => vcs.merge_base(head, &index.integration_head).await?,
    };

    let files_touched = vcs.changed_files(&base, head).await?;
    let mut exported_symbols = BTreeSet::new();
    let mut manifest_packages = BTreeSet::new();
    for path in &files_touched {
        let before = vcs.read_file(&base, path).await?;
        let after = vcs.read_file(head, path).await?;
        if let Some(kind) = manifest::manifest_kind(path) {
            manifest_packages.extend(manifest::changed_packages(kind, before.as_deref(), after.as_deref())?);
        } else {
            exported_symbols.extend(symbols::changed_symbols(path, before.as_deref(), after.as_deref()));
        }
    }

    let commits = vcs.commits_between(&base, head).await?;
    let last_activity = match commits.last() {
        Some(commit) => commit.timestamp,
        None => vcs.commit_info(head).await?.timestamp,
    };

    let facts = DerivedFacts {
        base_revision: base,
        head_revision: head.clone(),
        derived_risk_flags: tagger.flags_for_all(&files_touched),
        files_touched,
        exported_symbols,
        manifest_packages,
        prerequisites,
        last_activity,
        delivered,
    };
    Ok((facts, commits))
}
