use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::cluster::ClusterId;
use crate::oracle::{IntentSummary, SynthesizedTest};
use crate::registry::{ChangeSetId, RiskFlag};
use crate::store::StoreError;
use crate::vcs::{Patch, Revision};

/// How a candidate was produced
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "member", rename_all = "snake_case")]
pub enum Strategy {
    /// Contested files follow one member, the others are adapted to it
    MemberPrimary(ChangeSetId),
    /// Contested files follow repository conventions
    ConventionPrimary,
    /// Only uncontested files; contested ones are deferred
    MinimalMerge,
    /// Contested regions rewritten from the members' intents
    FreshSynthesis,
    /// Mechanical merge from a fast path
    CleanMerge,
}

impl Strategy {
    pub fn label(&self) -> String {
        match self {
            Strategy::MemberPrimary(member) => format!("member_primary:{member}"),
            Strategy::ConventionPrimary => "convention_primary".to_string(),
            Strategy::MinimalMerge => "minimal_merge".to_string(),
            Strategy::FreshSynthesis => "fresh_synthesis".to_string(),
            Strategy::CleanMerge => "clean_merge".to_string(),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTier {
    Build,
    Lint,
    TargetedTests,
    FullSuite,
}

impl fmt::Display for ValidationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValidationTier::Build => "build",
            ValidationTier::Lint => "lint",
            ValidationTier::TargetedTests => "targeted_tests",
            ValidationTier::FullSuite => "full_suite",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationScores {
    pub build_passed: bool,
    pub lint_score: f64,
    pub tests_passed: u32,
    pub tests_failed: Vec<String>,
    /// Known-flaky tests that failed twice; they cost score, not the candidate
    pub flaky_failures: Vec<String>,
    pub full_suite_run: bool,
    pub correctness: f64,
    pub simplicity: f64,
    pub convention: f64,
    pub intent_satisfaction: f64,
    /// First tier the candidate failed, `None` when it passed every required tier
    pub eliminated_at: Option<ValidationTier>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub strategy: Strategy,
    pub patch: Patch,
    /// Candidate tree committed on top of the run's base
    pub revision: Revision,
    pub summary: String,
    pub deferred_files: BTreeSet<String>,
    pub scores: ValidationScores,
    pub total_score: f64,
}

impl Candidate {
    pub fn passed(&self) -> bool {
        self.scores.eliminated_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    FastPath,
    ContextAssembly,
    IntentExtraction,
    InterfaceHarmonization,
    TestSynthesis,
    CandidateGeneration,
    Validation,
    Decision,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineStage::FastPath => "fast_path",
            PipelineStage::ContextAssembly => "context_assembly",
            PipelineStage::IntentExtraction => "intent_extraction",
            PipelineStage::InterfaceHarmonization => "interface_harmonization",
            PipelineStage::TestSynthesis => "test_synthesis",
            PipelineStage::CandidateGeneration => "candidate_generation",
            PipelineStage::Validation => "validation",
            PipelineStage::Decision => "decision",
        };
        f.write_str(label)
    }
}

/// Why a cluster goes to a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence { member: ChangeSetId, confidence: f64 },
    ConflictingIntent { subject: String, members: Vec<ChangeSetId> },
    CannotHarmonize { symbol: String, detail: String },
    TooFewCandidates { produced: usize, required: usize },
    ValidationFailed { diagnostics: Vec<String> },
    InsufficientMargin { top: f64, runner_up: f64 },
    HighRisk { flags: Vec<RiskFlag> },
    DeferredFiles { files: Vec<String> },
    IncompatibleDependency { package: String, requirements: Vec<String> },
    BudgetExceeded { resource: String },
    CircuitOpen,
    Cancelled,
    StageFailed { stage: PipelineStage, detail: String },
    RebaseExhausted { attempts: u32 },
    RevertConflict { change_set: ChangeSetId, files: Vec<String> },
}

impl EscalationReason {
    pub fn code(&self) -> &'static str {
        match self {
            EscalationReason::LowConfidence { .. } => "low_confidence",
            EscalationReason::ConflictingIntent { .. } => "conflicting_intent",
            EscalationReason::CannotHarmonize { .. } => "cannot_harmonize",
            EscalationReason::TooFewCandidates { .. } => "too_few_candidates",
            EscalationReason::ValidationFailed { .. } => "validation_failed",
            EscalationReason::InsufficientMargin { .. } => "insufficient_margin",
            EscalationReason::HighRisk { .. } => "high_risk",
            EscalationReason::DeferredFiles { .. } => "deferred_files",
            EscalationReason::IncompatibleDependency { .. } => "incompatible_dependency",
            EscalationReason::BudgetExceeded { .. } => "budget_exceeded",
            EscalationReason::CircuitOpen => "circuit_open",
            EscalationReason::Cancelled => "cancelled",
            EscalationReason::StageFailed { .. } => "stage_failed",
            EscalationReason::RebaseExhausted { .. } => "rebase_exhausted",
            EscalationReason::RevertConflict { .. } => "revert_conflict",
        }
    }

    /// Resource or infrastructure reasons: the same inputs may resolve in a
    /// later cycle, so the decision is not kept
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscalationReason::BudgetExceeded { .. }
                | EscalationReason::CircuitOpen
                | EscalationReason::Cancelled
                | EscalationReason::StageFailed { .. }
        )
    }

    /// What a human can safely do without reading further
    pub fn safe_default(&self) -> &'static str {
        match self {
            EscalationReason::LowConfidence { .. } | EscalationReason::ConflictingIntent { .. } => {
                "keep the integration branch unchanged and clarify the members' intent"
            }
            EscalationReason::CannotHarmonize { .. } => "keep the integration branch unchanged and pick one interface",
            EscalationReason::TooFewCandidates { .. } | EscalationReason::ValidationFailed { .. } => {
                "keep the integration branch unchanged"
            }
            EscalationReason::InsufficientMargin { .. } | EscalationReason::HighRisk { .. } => {
                "review and accept the top-ranked candidate"
            }
            EscalationReason::DeferredFiles { .. } => "accept the minimal merge and resolve deferred files by hand",
            EscalationReason::IncompatibleDependency { .. } => "keep the currently required dependency versions",
            EscalationReason::BudgetExceeded { .. }
            | EscalationReason::CircuitOpen
            | EscalationReason::Cancelled
            | EscalationReason::StageFailed { .. } => "retry in a later cycle",
            EscalationReason::RebaseExhausted { .. } => "rebase the members onto the integration branch and retry",
            EscalationReason::RevertConflict { .. } => "revert to the latest checkpoint instead",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::LowConfidence { member, confidence } => {
                write!(f, "intent confidence for {member} is {confidence:.2}")
            }
            EscalationReason::ConflictingIntent { subject, members } => write!(
                f,
                "hard constraints on {subject} are mutually exclusive between {}",
                join(members)
            ),
            EscalationReason::CannotHarmonize { symbol, detail } => {
                write!(f, "adapted tree for {symbol} does not build: {detail}")
            }
            EscalationReason::TooFewCandidates { produced, required } => {
                write!(f, "only {produced} distinct candidates were produced, {required} required")
            }
            EscalationReason::ValidationFailed { diagnostics } => {
                write!(f, "no candidate passed validation ({})", diagnostics.join("; "))
            }
            EscalationReason::InsufficientMargin { top, runner_up } => {
                write!(f, "top candidate {top:.3} does not clearly beat runner-up {runner_up:.3}")
            }
            EscalationReason::HighRisk { flags } => {
                let names: Vec<String> = flags.iter().map(|flag| format!("{flag:?}").to_lowercase()).collect();
                write!(f, "cluster touches high-risk areas: {}", names.join(", "))
            }
            EscalationReason::DeferredFiles { files } => {
                write!(f, "best candidate defers contested files: {}", files.join(", "))
            }
            EscalationReason::IncompatibleDependency { package, requirements } => write!(
                f,
                "no compatible version of {package} satisfies {}",
                requirements.join(" and ")
            ),
            EscalationReason::BudgetExceeded { resource } => write!(f, "{resource} budget exhausted"),
            EscalationReason::CircuitOpen => f.write_str("circuit breaker is open"),
            EscalationReason::Cancelled => f.write_str("run was cancelled"),
            EscalationReason::StageFailed { stage, detail } => write!(f, "{stage} failed: {detail}"),
            EscalationReason::RebaseExhausted { attempts } => {
                write!(f, "could not land after {attempts} rebase attempts")
            }
            EscalationReason::RevertConflict { change_set, files } => {
                write!(f, "reverting {change_set} conflicts in {}", files.join(", "))
            }
        }
    }
}

fn join(ids: &[ChangeSetId]) -> String {
    ids.iter().map(ChangeSetId::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    Candidate { index: usize, strategy: Strategy },
    KeepIntegrationBranch,
}

/// Work worth keeping when a cluster re-enters at candidate generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionMemo {
    pub intents: Vec<IntentSummary>,
    pub adapter: Patch,
    pub merged_tests: Patch,
    pub synthesized_tests: Vec<SynthesizedTest>,
}

impl ResolutionMemo {
    pub fn min_confidence(&self) -> Option<f64> {
        self.intents.iter().map(|i| i.confidence).reduce(f64::min)
    }

    /// Adapter and tests every generated candidate builds on
    pub fn scaffold(&self) -> Patch {
        let mut scaffold = self.adapter.clone();
        scaffold.overlay(&self.merged_tests);
        for test in &self.synthesized_tests {
            scaffold.write(test.path.clone(), test.body.clone());
        }
        scaffold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub key: String,
    pub cluster_id: ClusterId,
    pub base: Revision,
    pub members: Vec<ChangeSetId>,
    pub member_heads: Vec<Revision>,
    pub candidate: Candidate,
    pub fast_path: bool,
    pub min_intent_confidence: Option<f64>,
    pub memo: ResolutionMemo,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub key: String,
    pub cluster_id: ClusterId,
    pub base: Revision,
    pub members: Vec<ChangeSetId>,
    pub member_heads: Vec<Revision>,
    pub reason: EscalationReason,
    /// Best first
    pub ranked: Vec<Candidate>,
    pub recommended: Recommendation,
    pub min_intent_confidence: Option<f64>,
    pub memo: ResolutionMemo,
    pub decided_at: DateTime<Utc>,
}

/// Terminal outcome of one pipeline run. Never modified after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    AutoResolve(Resolution),
    Escalate(Escalation),
}

impl Decision {
    pub fn key(&self) -> &str {
        match self {
            Decision::AutoResolve(resolution) => &resolution.key,
            Decision::Escalate(escalation) => &escalation.key,
        }
    }

    pub fn cluster_id(&self) -> &ClusterId {
        match self {
            Decision::AutoResolve(resolution) => &resolution.cluster_id,
            Decision::Escalate(escalation) => &escalation.cluster_id,
        }
    }

    pub fn members(&self) -> &[ChangeSetId] {
        match self {
            Decision::AutoResolve(resolution) => &resolution.members,
            Decision::Escalate(escalation) => &escalation.members,
        }
    }

    pub fn is_escalation(&self) -> bool {
        matches!(self, Decision::Escalate(_))
    }

    pub fn label(&self) -> String {
        match self {
            Decision::AutoResolve(resolution) => format!("auto_resolve ({})", resolution.candidate.strategy),
            Decision::Escalate(escalation) => format!("escalate ({})", escalation.reason.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: String,
}

/// Errors that abort a run without escalating
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input error during {stage}: {message}")]
    Input { stage: PipelineStage, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_labels_name_the_member() {
        assert_eq!(
            Strategy::MemberPrimary(ChangeSetId::new("agent/a")).label(),
            "member_primary:agent/a"
        );
        assert_eq!(Strategy::MinimalMerge.label(), "minimal_merge");
    }

    #[test]
    fn test_every_reason_has_a_safe_default() {
        let reasons = vec![
            EscalationReason::CircuitOpen,
            EscalationReason::ValidationFailed { diagnostics: vec![] },
            EscalationReason::RebaseExhausted { attempts: 3 },
        ];
        for reason in reasons {
            assert!(!reason.safe_default().is_empty());
            assert!(!reason.to_string().is_empty());
        }
        assert_eq!(
            EscalationReason::LowConfidence {
                member: ChangeSetId::new("a"),
                confidence: 0.2
            }
            .code(),
            "low_confidence"
        );
    }
}
