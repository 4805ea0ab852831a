//! Cluster building
//!
//! Change sets sharing a file, an exported symbol or a manifest package are
//! grouped with union-find, then split again along real conflict edges found
//! by the classifier. Clusters are ordered into waves that must resolve one
//! after another.

mod builder;
mod waves;

pub use builder::{assemble, candidate_groups, refine, ClusterBuilder, ResourceKey};
pub use waves::order_waves;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::classify::{Classification, ClassifyError, GroupClassification, PairClassification, Severity};
use crate::registry::{ChangeSet, ChangeSetId};
use crate::store::content_key;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster dependency cycle between {}", format_ids(.clusters))]
    DependencyCycle { clusters: Vec<ClusterId> },

    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

fn format_ids(ids: &[ClusterId]) -> String {
    ids.iter().map(ClusterId::to_string).collect::<Vec<_>>().join(", ")
}

/// Deterministic identifier derived from the sorted member ids
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn for_members<'a>(members: impl IntoIterator<Item = &'a ChangeSetId>) -> Self {
        let mut ids: Vec<&str> = members.into_iter().map(ChangeSetId::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        let mut parts = vec!["cluster"];
        parts.extend(ids);
        Self(format!("c-{}", content_key(&parts)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Fast,
    Medium,
    Slow,
}

impl CostClass {
    fn estimate(group: &GroupClassification) -> Self {
        if group.severity.is_architectural() {
            return CostClass::Slow;
        }
        match group.classification {
            Classification::None | Classification::Dependency => CostClass::Fast,
            Classification::Textual if group.textual_confidence >= 1.0 => CostClass::Fast,
            Classification::Textual => CostClass::Medium,
            Classification::Semantic => CostClass::Slow,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: ClusterId,
    /// Member snapshots, sorted by id
    pub members: Vec<ChangeSet>,
    pub shared_files: BTreeSet<String>,
    /// Top-level directories of the shared files
    pub shared_domains: BTreeSet<String>,
    /// Files of change sets the members are stacked on, outside this cluster
    pub required_base: BTreeSet<String>,
    pub depends_on: BTreeSet<ClusterId>,
    pub cost_class: CostClass,
    pub classification: GroupClassification,
    pub pairs: Vec<PairClassification>,
}

impl Cluster {
    pub(crate) fn new(
        mut members: Vec<ChangeSet>,
        classification: GroupClassification,
        pairs: Vec<PairClassification>,
    ) -> Self {
        members.sort_by(|a, b| a.id.cmp(&b.id));
        let id = ClusterId::for_members(members.iter().map(|cs| &cs.id));
        let shared_files = classification.shared_files.clone();
        let shared_domains = shared_files
            .iter()
            .map(|path| match path.split_once('/') {
                Some((top, _)) => top.to_string(),
                None => ".".to_string(),
            })
            .collect();
        let cost_class = CostClass::estimate(&classification);
        Self {
            id,
            members,
            shared_files,
            shared_domains,
            required_base: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            cost_class,
            classification,
            pairs,
        }
    }

    pub fn member_ids(&self) -> Vec<ChangeSetId> {
        self.members.iter().map(|cs| cs.id.clone()).collect()
    }

    pub fn contains(&self, id: &ChangeSetId) -> bool {
        self.members.iter().any(|cs| &cs.id == id)
    }

    pub fn severity(&self) -> Severity {
        self.classification.severity
    }
}

/// Output of one clustering pass
#[derive(Debug, Clone, Serialize)]
pub struct ClusterPlan {
    pub clusters: Vec<Cluster>,
    /// Cluster ids per wave, earliest first
    pub waves: Vec<Vec<ClusterId>>,
}

impl ClusterPlan {
    pub fn cluster(&self, id: &ClusterId) -> Option<&Cluster> {
        self.clusters.iter().find(|c| &c.id == id)
    }

    pub fn wave_clusters(&self, wave: usize) -> Vec<&Cluster> {
        self.waves
            .get(wave)
            .map(|ids| ids.iter().filter_map(|id| self.cluster(id)).collect())
            .unwrap_or_default()
    }

    /// Cluster holding `id`, if the change set was planned at all
    pub fn cluster_of(&self, id: &ChangeSetId) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.contains(id))
    }
}
