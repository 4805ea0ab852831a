use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::registry::{ChangeSetId, RiskFlag};

use super::severity::{self, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Textual,
    Semantic,
    Dependency,
}

/// Routing class of a pair or a group. Ordered by how much work resolution takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    None,
    Dependency,
    Textual,
    Semantic,
}

impl Classification {
    /// The class that dominates routing when both appear in one group
    pub fn dominant(self, other: Classification) -> Classification {
        self.max(other)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::None => "none",
            Classification::Dependency => "dependency",
            Classification::Textual => "textual",
            Classification::Semantic => "semantic",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evidence {
    File { path: String },
    Package { key: String, ours: Option<String>, theirs: Option<String> },
    BuildFailure { summary: String },
    TestFailure { tests: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEdge {
    pub a: ChangeSetId,
    pub b: ChangeSetId,
    pub kind: ConflictKind,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlap {
    pub files: BTreeSet<String>,
    pub symbols: BTreeSet<String>,
    pub packages: BTreeSet<String>,
}

impl Overlap {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.symbols.is_empty() && self.packages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairClassification {
    pub a: ChangeSetId,
    pub b: ChangeSetId,
    pub classification: Classification,
    pub edges: Vec<ConflictEdge>,
    pub overlap: Overlap,
    /// Share of textual conflicts the structural merge resolves
    pub textual_confidence: f64,
    pub semantic_failure: bool,
    pub risk_flags: BTreeSet<RiskFlag>,
    pub severity: Severity,
}

impl PairClassification {
    pub fn conflicts(&self) -> bool {
        self.classification != Classification::None
    }
}

/// Classification of a whole cluster, aggregated from its pairs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupClassification {
    pub members: Vec<ChangeSetId>,
    pub classification: Classification,
    pub edges: Vec<ConflictEdge>,
    pub textual_confidence: f64,
    pub risk_flags: BTreeSet<RiskFlag>,
    pub severity: Severity,
    pub shared_files: BTreeSet<String>,
}

impl GroupClassification {
    pub fn independent(members: Vec<ChangeSetId>, risk_flags: BTreeSet<RiskFlag>) -> Self {
        let severity = severity::assess(&risk_flags, 1, false);
        Self {
            members,
            classification: Classification::None,
            edges: Vec::new(),
            textual_confidence: 1.0,
            risk_flags,
            severity,
            shared_files: BTreeSet::new(),
        }
    }

    /// Aggregate pair results over a group of members
    pub fn from_pairs(
        members: Vec<ChangeSetId>,
        pairs: &[PairClassification],
        member_flags: &BTreeMap<ChangeSetId, BTreeSet<RiskFlag>>,
    ) -> Self {
        let mut classification = Classification::None;
        let mut edges = Vec::new();
        let mut textual_confidence: f64 = 1.0;
        let mut semantic_failure = false;
        let mut risk_flags: BTreeSet<RiskFlag> = members
            .iter()
            .filter_map(|m| member_flags.get(m))
            .flatten()
            .copied()
            .collect();
        let mut shared_files = BTreeSet::new();

        for pair in pairs {
            if !members.contains(&pair.a) || !members.contains(&pair.b) {
                continue;
            }
            classification = classification.dominant(pair.classification);
            edges.extend(pair.edges.iter().cloned());
            if pair.classification == Classification::Textual {
                textual_confidence = textual_confidence.min(pair.textual_confidence);
            }
            semantic_failure |= pair.semantic_failure;
            risk_flags.extend(pair.risk_flags.iter().copied());
            if pair.conflicts() {
                shared_files.extend(pair.overlap.files.iter().cloned());
            }
        }

        let severity = severity::assess(&risk_flags, members.len(), semantic_failure);
        Self {
            members,
            classification,
            edges,
            textual_confidence,
            risk_flags,
            severity,
            shared_files,
        }
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_flags.iter().any(|f| f.is_high_risk())
    }

    pub fn high_risk_flags(&self) -> Vec<RiskFlag> {
        self.risk_flags.iter().copied().filter(|f| f.is_high_risk()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_dominates_textual() {
        assert_eq!(Classification::Textual.dominant(Classification::Semantic), Classification::Semantic);
        assert_eq!(Classification::Dependency.dominant(Classification::Semantic), Classification::Semantic);
        assert_eq!(Classification::None.dominant(Classification::Dependency), Classification::Dependency);
    }
}
