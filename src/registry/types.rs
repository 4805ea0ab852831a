use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::vcs::Revision;

/// Stable identifier of one worker's unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSetId(String);

impl ChangeSetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChangeSetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSetStatus {
    Pending,
    Complete,
    Resolved,
    Failed,
    Stale,
}

impl fmt::Display for ChangeSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeSetStatus::Pending => "pending",
            ChangeSetStatus::Complete => "complete",
            ChangeSetStatus::Resolved => "resolved",
            ChangeSetStatus::Failed => "failed",
            ChangeSetStatus::Stale => "stale",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    Security,
    Auth,
    Schema,
    PublicInterface,
}

impl RiskFlag {
    /// Flags that require the full suite and a human sign-off
    pub fn is_high_risk(self) -> bool {
        matches!(self, RiskFlag::Security | RiskFlag::Schema | RiskFlag::PublicInterface)
    }
}

/// Self-reported facts about a change set. Advisory only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetHint {
    pub id: Option<String>,
    pub branch: String,
    #[serde(default)]
    pub reported_files: Vec<String>,
    #[serde(default)]
    pub risk_flags: BTreeSet<RiskFlag>,
    #[serde(default)]
    pub completion_marker: bool,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ChangeSetHint {
    pub fn for_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            ..Default::default()
        }
    }

    pub fn change_set_id(&self) -> ChangeSetId {
        match &self.id {
            Some(id) => ChangeSetId::new(id.clone()),
            None => ChangeSetId::new(self.branch.clone()),
        }
    }
}

/// Facts derived from version control, never from the worker's report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedFacts {
    pub base_revision: Revision,
    pub head_revision: Revision,
    pub files_touched: BTreeSet<String>,
    pub exported_symbols: BTreeSet<String>,
    pub manifest_packages: BTreeSet<String>,
    pub prerequisites: BTreeSet<ChangeSetId>,
    pub derived_risk_flags: BTreeSet<RiskFlag>,
    pub last_activity: DateTime<Utc>,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub branch: String,
    pub base_revision: Revision,
    pub head_revision: Revision,
    pub files_touched: BTreeSet<String>,
    pub exported_symbols: BTreeSet<String>,
    pub manifest_packages: BTreeSet<String>,
    pub prerequisites: BTreeSet<ChangeSetId>,
    pub status: ChangeSetStatus,
    pub declared_risk_flags: BTreeSet<RiskFlag>,
    pub derived_risk_flags: BTreeSet<RiskFlag>,
    pub completion_score: f64,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ChangeSet {
    pub fn risk_flags(&self) -> BTreeSet<RiskFlag> {
        self.declared_risk_flags
            .union(&self.derived_risk_flags)
            .copied()
            .collect()
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_flags().into_iter().any(RiskFlag::is_high_risk)
    }
}
