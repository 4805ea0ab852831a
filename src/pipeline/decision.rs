use crate::config::PipelineConfig;
use crate::oracle::IntentSummary;
use crate::registry::RiskFlag;

use super::{Candidate, EscalationReason, Recommendation};

/// Outcome of the decision rule over ranked candidates
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Index of the winning candidate
    Accept(usize),
    Escalate {
        reason: EscalationReason,
        recommended: Recommendation,
    },
}

/// Top candidate when it validated, otherwise leave the integration branch alone
pub fn recommend(ranked: &[Candidate]) -> Recommendation {
    match ranked.first() {
        Some(top) if top.passed() => Recommendation::Candidate {
            index: 0,
            strategy: top.strategy.clone(),
        },
        _ => Recommendation::KeepIntegrationBranch,
    }
}

/// Auto-resolve only when the top candidate validated, clearly beats the
/// runner-up, touches no high-risk area, defers nothing and every intent was
/// read with enough confidence. Otherwise name the first rule that failed.
pub fn decide(
    ranked: &[Candidate],
    high_risk: &[RiskFlag],
    intents: &[IntentSummary],
    settings: &PipelineConfig,
) -> Verdict {
    let escalate = |reason| Verdict::Escalate {
        reason,
        recommended: recommend(ranked),
    };

    let Some(top) = ranked.first().filter(|c| c.passed()) else {
        let diagnostics = ranked
            .iter()
            .flat_map(|c| c.scores.diagnostics.iter().map(move |d| format!("{}: {d}", c.strategy)))
            .collect();
        return escalate(EscalationReason::ValidationFailed { diagnostics });
    };

    if !high_risk.is_empty() {
        return escalate(EscalationReason::HighRisk {
            flags: high_risk.to_vec(),
        });
    }

    let weakest = intents.iter().min_by(|a, b| a.confidence.total_cmp(&b.confidence));
    if let Some(intent) = weakest.filter(|i| i.confidence < settings.auto_resolve_confidence) {
        return escalate(EscalationReason::LowConfidence {
            member: intent.member.clone(),
            confidence: intent.confidence,
        });
    }

    let runner_up = ranked.get(1).map(|c| c.total_score).unwrap_or(0.0);
    if top.total_score - runner_up < settings.decision_margin {
        return escalate(EscalationReason::InsufficientMargin {
            top: top.total_score,
            runner_up,
        });
    }

    if !top.deferred_files.is_empty() {
        return escalate(EscalationReason::DeferredFiles {
            files: top.deferred_files.iter().cloned().collect(),
        });
    }

    Verdict::Accept(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Strategy, ValidationScores, ValidationTier};
    use crate::registry::ChangeSetId;
    use crate::vcs::{Patch, Revision};
    use std::collections::BTreeSet;

    fn candidate(strategy: Strategy, score: f64, passed: bool) -> Candidate {
        Candidate {
            strategy,
            patch: Patch::new(),
            revision: Revision::new("r"),
            summary: String::new(),
            deferred_files: BTreeSet::new(),
            scores: ValidationScores {
                eliminated_at: (!passed).then_some(ValidationTier::Build),
                diagnostics: if passed { vec![] } else { vec!["build: boom".to_string()] },
                ..Default::default()
            },
            total_score: score,
        }
    }

    fn member(id: &str) -> Strategy {
        Strategy::MemberPrimary(ChangeSetId::new(id))
    }

    fn intents(confidence: f64) -> Vec<IntentSummary> {
        vec![IntentSummary {
            member: ChangeSetId::new("a"),
            primary_intent: "a".to_string(),
            hard_constraints: vec![],
            soft_constraints: vec![],
            confidence,
        }]
    }

    #[test]
    fn test_clear_winner_is_accepted() {
        let ranked = vec![candidate(member("a"), 0.9, true), candidate(member("b"), 0.7, true)];
        assert_eq!(
            decide(&ranked, &[], &intents(0.9), &PipelineConfig::default()),
            Verdict::Accept(0)
        );
    }

    #[test]
    fn test_close_scores_escalate_with_the_top_recommended() {
        let ranked = vec![candidate(member("a"), 0.80, true), candidate(member("b"), 0.79, true)];
        match decide(&ranked, &[], &intents(0.9), &PipelineConfig::default()) {
            Verdict::Escalate { reason, recommended } => {
                assert_eq!(reason.code(), "insufficient_margin");
                assert_eq!(
                    recommended,
                    Recommendation::Candidate {
                        index: 0,
                        strategy: member("a")
                    }
                );
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_high_risk_always_escalates() {
        let ranked = vec![candidate(member("a"), 0.95, true)];
        let verdict = decide(&ranked, &[RiskFlag::Security], &intents(1.0), &PipelineConfig::default());
        assert!(matches!(
            verdict,
            Verdict::Escalate {
                reason: EscalationReason::HighRisk { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_nothing_validated_keeps_the_integration_branch() {
        let ranked = vec![candidate(member("a"), 0.2, false)];
        match decide(&ranked, &[], &intents(0.9), &PipelineConfig::default()) {
            Verdict::Escalate { reason, recommended } => {
                assert_eq!(reason.code(), "validation_failed");
                assert_eq!(recommended, Recommendation::KeepIntegrationBranch);
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_moderate_intent_confidence_escalates() {
        let ranked = vec![candidate(member("a"), 0.9, true)];
        let verdict = decide(&ranked, &[], &intents(0.65), &PipelineConfig::default());
        assert!(matches!(
            verdict,
            Verdict::Escalate {
                reason: EscalationReason::LowConfidence { .. },
                ..
            }
        ));
    }
}
