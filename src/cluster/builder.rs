use petgraph::unionfind::UnionFind;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::classify::{ConflictClassifier, GroupClassification, PairClassification};
use crate::registry::{ChangeSet, ChangeSetId, ChangeSetStatus};

use super::{order_waves, Cluster, ClusterError, ClusterPlan};

/// A resource a change set owns. Symbols and packages are virtual resources
/// linking change sets that never touch the same file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
    File(String),
    Symbol(String),
    Package(String),
}

fn resources(change_set: &ChangeSet) -> impl Iterator<Item = ResourceKey> + '_ {
    let files = change_set.files_touched.iter().cloned().map(ResourceKey::File);
    let symbols = change_set.exported_symbols.iter().cloned().map(ResourceKey::Symbol);
    let packages = change_set.manifest_packages.iter().cloned().map(ResourceKey::Package);
    files.chain(symbols).chain(packages)
}

/// Indices of change sets connected through shared resources.
/// Each group is sorted and groups are ordered by their first index.
pub fn candidate_groups(change_sets: &[ChangeSet]) -> Vec<Vec<usize>> {
    let mut sets = UnionFind::<usize>::new(change_sets.len());
    let mut owner: HashMap<ResourceKey, usize> = HashMap::new();

    for (index, change_set) in change_sets.iter().enumerate() {
        for resource in resources(change_set) {
            match owner.entry(resource) {
                Entry::Occupied(first) => {
                    sets.union(*first.get(), index);
                }
                Entry::Vacant(slot) => {
                    slot.insert(index);
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..change_sets.len() {
        groups.entry(sets.find(index)).or_default().push(index);
    }
    let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
    groups.sort_by_key(|group| group[0]);
    groups
}

/// Split `members` into components connected by conflicting pairs
pub fn refine(members: &[ChangeSetId], pairs: &[PairClassification]) -> Vec<Vec<ChangeSetId>> {
    let position: HashMap<&ChangeSetId, usize> = members.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut sets = UnionFind::<usize>::new(members.len());
    for pair in pairs.iter().filter(|p| p.conflicts()) {
        if let (Some(&a), Some(&b)) = (position.get(&pair.a), position.get(&pair.b)) {
            sets.union(a, b);
        }
    }

    let mut components: BTreeMap<usize, Vec<ChangeSetId>> = BTreeMap::new();
    for (index, id) in members.iter().enumerate() {
        components.entry(sets.find(index)).or_default().push(id.clone());
    }
    let mut components: Vec<Vec<ChangeSetId>> = components
        .into_values()
        .map(|mut ids| {
            ids.sort();
            ids
        })
        .collect();
    components.sort();
    components
}

/// Turn classified change sets into clusters and waves. Pure over its inputs.
pub fn assemble(mut change_sets: Vec<ChangeSet>, pairs: Vec<PairClassification>) -> Result<ClusterPlan, ClusterError> {
    change_sets.sort_by(|a, b| a.id.cmp(&b.id));
    let ids: Vec<ChangeSetId> = change_sets.iter().map(|cs| cs.id.clone()).collect();
    let in_pass: BTreeSet<&ChangeSetId> = ids.iter().collect();
    let by_id: BTreeMap<ChangeSetId, ChangeSet> = change_sets.iter().map(|cs| (cs.id.clone(), cs.clone())).collect();

    let mut clusters = Vec::new();
    let mut bundle = Vec::new();
    for component in refine(&ids, &pairs) {
        if component.len() > 1 {
            let members: Vec<ChangeSet> = component.iter().map(|id| by_id[id].clone()).collect();
            let own_pairs: Vec<PairClassification> = pairs
                .iter()
                .filter(|p| component.contains(&p.a) && component.contains(&p.b))
                .cloned()
                .collect();
            let classification = ConflictClassifier::summarize(&members, &own_pairs);
            clusters.push(Cluster::new(members, classification, own_pairs));
            continue;
        }

        let change_set = by_id[&component[0]].clone();
        let stacked = change_set.prerequisites.iter().any(|p| in_pass.contains(p));
        if stacked {
            let flags = change_set.risk_flags();
            let classification = GroupClassification::independent(vec![change_set.id.clone()], flags);
            clusters.push(Cluster::new(vec![change_set], classification, Vec::new()));
        } else {
            bundle.push(change_set);
        }
    }

    if !bundle.is_empty() {
        let flags = bundle.iter().flat_map(|cs| cs.risk_flags()).collect();
        let classification = GroupClassification::independent(bundle.iter().map(|cs| cs.id.clone()).collect(), flags);
        clusters.push(Cluster::new(bundle, classification, Vec::new()));
    }

    for cluster in &mut clusters {
        let mut required = BTreeSet::new();
        for member in &cluster.members {
            for prerequisite in &member.prerequisites {
                if cluster.members.iter().any(|m| &m.id == prerequisite) {
                    continue;
                }
                if let Some(below) = by_id.get(prerequisite) {
                    required.extend(below.files_touched.iter().cloned());
                }
            }
        }
        cluster.required_base = required;
    }
    clusters.sort_by(|a, b| a.members[0].id.cmp(&b.members[0].id));

    let waves = order_waves(&mut clusters)?;
    Ok(ClusterPlan { clusters, waves })
}

pub struct ClusterBuilder {
    classifier: Arc<ConflictClassifier>,
}

impl ClusterBuilder {
    pub fn new(classifier: Arc<ConflictClassifier>) -> Self {
        Self { classifier }
    }

    /// Group, classify within each group, refine and order into waves
    pub async fn build(&self, change_sets: Vec<ChangeSet>) -> Result<ClusterPlan, ClusterError> {
        let (mut complete, skipped): (Vec<ChangeSet>, Vec<ChangeSet>) = change_sets
            .into_iter()
            .partition(|cs| cs.status == ChangeSetStatus::Complete);
        for change_set in &skipped {
            debug!(change_set = %change_set.id, status = %change_set.status, "Excluded from clustering");
        }
        complete.sort_by(|a, b| a.id.cmp(&b.id));

        let mut pairs = Vec::new();
        for group in candidate_groups(&complete) {
            if group.len() < 2 {
                continue;
            }
            let members: Vec<ChangeSet> = group.iter().map(|&i| complete[i].clone()).collect();
            pairs.extend(self.classifier.classify_group(&members).await?);
        }

        let plan = assemble(complete, pairs)?;
        info!(
            clusters = plan.clusters.len(),
            waves = plan.waves.len(),
            "Cluster plan ready"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, Overlap, Severity};
    use crate::vcs::Revision;
    use chrono::Utc;

    fn change_set(id: &str, files: &[&str]) -> ChangeSet {
        ChangeSet {
            id: ChangeSetId::new(id),
            branch: id.to_string(),
            base_revision: Revision::new("base"),
            head_revision: Revision::new(format!("head-{id}")),
            files_touched: files.iter().map(|f| f.to_string()).collect(),
            exported_symbols: BTreeSet::new(),
            manifest_packages: BTreeSet::new(),
            prerequisites: BTreeSet::new(),
            status: ChangeSetStatus::Complete,
            declared_risk_flags: BTreeSet::new(),
            derived_risk_flags: BTreeSet::new(),
            completion_score: 1.0,
            first_seen: Utc::now(),
            last_activity: Utc::now(),
        }
    }

    fn pair(a: &str, b: &str, classification: Classification, files: &[&str]) -> PairClassification {
        PairClassification {
            a: ChangeSetId::new(a),
            b: ChangeSetId::new(b),
            classification,
            edges: Vec::new(),
            overlap: Overlap {
                files: files.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            },
            textual_confidence: 0.0,
            semantic_failure: false,
            risk_flags: BTreeSet::new(),
            severity: Severity::Low,
        }
    }

    #[test]
    fn test_candidate_groups_follow_shared_files_transitively() {
        let sets = vec![
            change_set("a", &["x.rs"]),
            change_set("b", &["x.rs", "y.rs"]),
            change_set("c", &["y.rs"]),
            change_set("d", &["z.rs"]),
        ];
        assert_eq!(candidate_groups(&sets), vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn test_symbols_link_change_sets_without_shared_files() {
        let mut a = change_set("a", &["one.rs"]);
        let mut b = change_set("b", &["two.rs"]);
        a.exported_symbols.insert("helper".to_string());
        b.exported_symbols.insert("helper".to_string());
        assert_eq!(candidate_groups(&[a, b]), vec![vec![0, 1]]);
    }

    #[test]
    fn test_refine_splits_members_without_conflict_edges() {
        let ids: Vec<ChangeSetId> = ["a", "b", "c"].iter().map(|s| ChangeSetId::new(*s)).collect();
        let pairs = vec![
            pair("a", "b", Classification::Textual, &["x.rs"]),
            pair("a", "c", Classification::None, &["y.rs"]),
            pair("b", "c", Classification::None, &[]),
        ];
        let components = refine(&ids, &pairs);
        assert_eq!(
            components,
            vec![vec![ChangeSetId::new("a"), ChangeSetId::new("b")], vec![ChangeSetId::new("c")]]
        );
    }

    #[test]
    fn test_independent_change_sets_share_one_bundle() {
        let sets = vec![
            change_set("a", &["x.rs"]),
            change_set("b", &["x.rs"]),
            change_set("c", &["y.rs"]),
            change_set("d", &["z.rs"]),
        ];
        let pairs = vec![pair("a", "b", Classification::Textual, &["x.rs"])];
        let plan = assemble(sets, pairs).unwrap();

        assert_eq!(plan.clusters.len(), 2);
        let conflict = plan.cluster_of(&ChangeSetId::new("a")).unwrap();
        assert_eq!(conflict.member_ids(), vec![ChangeSetId::new("a"), ChangeSetId::new("b")]);
        assert_eq!(conflict.classification.classification, Classification::Textual);

        let bundle = plan.cluster_of(&ChangeSetId::new("c")).unwrap();
        assert!(bundle.contains(&ChangeSetId::new("d")));
        assert_eq!(bundle.classification.classification, Classification::None);
        assert_eq!(plan.waves.len(), 1);
    }

    #[test]
    fn test_every_complete_change_set_is_planned_exactly_once() {
        let sets = vec![
            change_set("a", &["x.rs"]),
            change_set("b", &["x.rs"]),
            change_set("c", &["y.rs"]),
        ];
        let pairs = vec![pair("a", "b", Classification::Semantic, &["x.rs"])];
        let plan = assemble(sets, pairs).unwrap();

        let mut planned: Vec<ChangeSetId> = plan.clusters.iter().flat_map(|c| c.member_ids()).collect();
        planned.sort();
        assert_eq!(planned, vec![ChangeSetId::new("a"), ChangeSetId::new("b"), ChangeSetId::new("c")]);
    }

    #[test]
    fn test_assemble_is_deterministic() {
        let sets = vec![
            change_set("c", &["y.rs"]),
            change_set("a", &["x.rs"]),
            change_set("b", &["x.rs"]),
        ];
        let pairs = vec![pair("a", "b", Classification::Textual, &["x.rs"])];
        let first = assemble(sets.clone(), pairs.clone()).unwrap();
        let mut reversed = sets;
        reversed.reverse();
        let second = assemble(reversed, pairs).unwrap();

        let ids = |plan: &ClusterPlan| plan.clusters.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first.waves, second.waves);
    }
}
