//! Reasoning oracle
//!
//! The oracle answers intent, adapter, test and candidate questions about a
//! [`ResolutionContext`]. Its answers are untrusted: confidences are clamped
//! and every produced patch is validated by real builds and tests.

mod command;

pub use command::{CommandOracle, UnconfiguredOracle};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{ResolutionContext, Strategy};
use crate::registry::ChangeSetId;
use crate::vcs::Patch;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle returned a malformed answer: {0}")]
    Malformed(String),
}

impl OracleError {
    /// Timeouts and unavailability may clear up on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Timeout { .. } | OracleError::Unavailable(_))
    }
}

/// A requirement one member's change must keep satisfied
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Constraint {
    pub subject: String,
    pub requirement: String,
}

impl Constraint {
    pub fn new(subject: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            requirement: requirement.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSummary {
    pub member: ChangeSetId,
    pub primary_intent: String,
    pub hard_constraints: Vec<Constraint>,
    pub soft_constraints: Vec<Constraint>,
    pub confidence: f64,
}

impl IntentSummary {
    /// Confidence forced into [0, 1]; NaN counts as no confidence
    pub fn clamped(mut self) -> Self {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRequest {
    pub symbol: String,
    pub canonical_signature: String,
    pub canonical_owner: Option<ChangeSetId>,
    /// Members whose differing signature must be adapted to the canonical one
    pub displaced: Vec<(ChangeSetId, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionPoint {
    pub path: String,
    pub symbol: Option<String>,
    pub members: Vec<ChangeSetId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizedTest {
    pub name: String,
    pub path: String,
    pub body: String,
    pub needs_review: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRequest {
    pub strategy: Strategy,
    pub intents: Vec<IntentSummary>,
    /// Uncontested changes, adapters and synthesized tests
    pub scaffold: Patch,
    pub contested: Vec<String>,
    /// Set when an earlier draft was too close to another candidate
    pub diversity_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDraft {
    pub patch: Patch,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub correctness: f64,
    pub simplicity: f64,
    pub convention: f64,
    pub intent_satisfaction: f64,
}

impl Critique {
    pub fn clamped(self) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self {
            correctness: clamp(self.correctness),
            simplicity: clamp(self.simplicity),
            convention: clamp(self.convention),
            intent_satisfaction: clamp(self.intent_satisfaction),
        }
    }
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn extract_intent(
        &self,
        context: &ResolutionContext,
        member: &ChangeSetId,
    ) -> Result<IntentSummary, OracleError>;

    /// Patch adapting displaced call sites to the canonical signature
    async fn propose_adapter(
        &self,
        context: &ResolutionContext,
        request: &AdapterRequest,
    ) -> Result<Patch, OracleError>;

    async fn synthesize_tests(
        &self,
        context: &ResolutionContext,
        points: &[InteractionPoint],
        limit: usize,
    ) -> Result<Vec<SynthesizedTest>, OracleError>;

    async fn synthesize_candidate(
        &self,
        context: &ResolutionContext,
        request: &CandidateRequest,
    ) -> Result<CandidateDraft, OracleError>;

    async fn critique(
        &self,
        context: &ResolutionContext,
        strategy: &Strategy,
        patch: &Patch,
    ) -> Result<Critique, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        let intent = IntentSummary {
            member: ChangeSetId::new("a"),
            primary_intent: "x".into(),
            hard_constraints: vec![],
            soft_constraints: vec![],
            confidence: 1.7,
        };
        assert_eq!(intent.clone().clamped().confidence, 1.0);

        let nan = IntentSummary {
            confidence: f64::NAN,
            ..intent
        };
        assert_eq!(nan.clamped().confidence, 0.0);
    }

    #[test]
    fn test_transient_errors() {
        assert!(OracleError::Unavailable("down".into()).is_transient());
        assert!(!OracleError::Malformed("bad json".into()).is_transient());
    }
}
