//! Human escalation
//!
//! Escalations are fire-and-forget from the pipeline's point of view: the
//! coordinator hands a record to an [`EscalationSink`] on a spawned task and
//! acts on the verdict whenever it arrives.

mod outbox;

pub use outbox::OutboxEscalationSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::cluster::ClusterId;
use crate::pipeline::{Escalation, Recommendation};
use crate::registry::ChangeSetId;
use crate::vcs::Revision;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One ranked option offered to the human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateOption {
    pub index: usize,
    pub strategy: String,
    pub revision: Revision,
    pub total_score: f64,
    pub summary: String,
    pub validated: bool,
}

/// What a human sees: a reason code, the options and a safe default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub key: String,
    pub cluster_id: ClusterId,
    pub members: Vec<ChangeSetId>,
    pub reason_code: String,
    pub reason: String,
    pub safe_default: String,
    pub recommended: Recommendation,
    pub min_intent_confidence: Option<f64>,
    pub options: Vec<CandidateOption>,
    pub created_at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn from_escalation(escalation: &Escalation) -> Self {
        Self {
            key: escalation.key.clone(),
            cluster_id: escalation.cluster_id.clone(),
            members: escalation.members.clone(),
            reason_code: escalation.reason.code().to_string(),
            reason: escalation.reason.to_string(),
            safe_default: escalation.reason.safe_default().to_string(),
            recommended: escalation.recommended.clone(),
            min_intent_confidence: escalation.min_intent_confidence,
            options: escalation
                .ranked
                .iter()
                .enumerate()
                .map(|(index, candidate)| CandidateOption {
                    index,
                    strategy: candidate.strategy.label(),
                    revision: candidate.revision.clone(),
                    total_score: candidate.total_score,
                    summary: candidate.summary.clone(),
                    validated: candidate.scores.eliminated_at.is_none(),
                })
                .collect(),
            created_at: escalation.decided_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum HumanVerdict {
    SelectOption { index: usize },
    RequestExplanation { question: String },
    CustomDirection { direction: String },
    TimedOut,
}

#[async_trait]
pub trait EscalationSink: Send + Sync {
    /// Present the record and wait up to `wait` for a verdict
    async fn escalate(&self, record: &EscalationRecord, wait: Duration) -> Result<HumanVerdict, SinkError>;
}
