//! Resolution pipeline
//!
//! A cluster either lands through a fast path (clean merge, structural text
//! merge, manifest alignment) or goes through the staged pipeline: context,
//! intents, interface harmonization, test synthesis, candidate generation,
//! validation and the decision rule. Every run ends in exactly one decision.

pub mod candidates;
pub mod context;
pub mod decision;
pub mod dependency;
pub mod harmonize;
pub mod intent;
mod runner;
pub mod test_synthesis;
mod types;
pub mod validation;

pub use context::{
    assemble, ChangeSummary, ContestedFile, ConventionSignals, IndentStyle, MemberContext, ResolutionContext,
};
pub use runner::{EntryPoint, PipelineRun, ResolutionPipeline};
pub use types::{
    Candidate, Decision, Escalation, EscalationReason, PipelineError, PipelineStage, Recommendation, Resolution,
    ResolutionMemo, StageRecord, Strategy, ValidationScores, ValidationTier,
};
