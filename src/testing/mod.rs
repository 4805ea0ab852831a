// Test doubles for the external collaborators

mod fakes;
mod memory_vcs;

pub use fakes::{RecordingSink, ScriptedExecutor, ScriptedOracle, StaticSource};
pub use memory_vcs::MemoryVcs;

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

use crate::classify::severity::RiskTagger;
use crate::config::StewardConfig;
use crate::registry::{derive_facts, ChangeSet, ChangeSetHint, ChangeSetId, ChangeSetStatus, HeadIndex};
use crate::vcs::VersionControl;

/// Hint for a branch whose worker reported done with passing tests
pub fn done_hint(branch: &str) -> ChangeSetHint {
    let mut hint = ChangeSetHint::for_branch(branch);
    hint.completion_marker = true;
    hint.tests_passed = Some(true);
    hint
}

/// Complete change sets for `branches`, derived the same way the registry does
pub async fn change_sets(vcs: &MemoryVcs, branches: &[&str]) -> Vec<ChangeSet> {
    let tagger = RiskTagger::new(&StewardConfig::default().classifier.risk_paths).unwrap();
    let mut heads = BTreeMap::new();
    for branch in branches {
        heads.insert(ChangeSetId::new(*branch), vcs.resolve(branch).await.unwrap());
    }
    let index = HeadIndex {
        integration_head: vcs.resolve("main").await.unwrap(),
        heads,
    };

    let mut out = Vec::new();
    for branch in branches {
        let hint = done_hint(branch);
        let head = index.heads[&ChangeSetId::new(*branch)].clone();
        let (facts, _) = derive_facts(vcs, &tagger, &index, &hint, &head).await.unwrap();
        out.push(ChangeSet {
            id: ChangeSetId::new(*branch),
            branch: branch.to_string(),
            base_revision: facts.base_revision,
            head_revision: facts.head_revision,
            files_touched: facts.files_touched,
            exported_symbols: facts.exported_symbols,
            manifest_packages: facts.manifest_packages,
            prerequisites: facts.prerequisites,
            status: ChangeSetStatus::Complete,
            declared_risk_flags: BTreeSet::new(),
            derived_risk_flags: facts.derived_risk_flags,
            completion_score: 1.0,
            first_seen: Utc::now(),
            last_activity: facts.last_activity,
        });
    }
    out
}
