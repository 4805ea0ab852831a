use std::collections::BTreeMap;

use crate::oracle::IntentSummary;
use crate::registry::ChangeSetId;

use super::EscalationReason;

/// Intents below the floor and mutually exclusive hard constraints both
/// stop the run before any candidate is produced.
pub fn check_intents(intents: &[IntentSummary], floor: f64) -> Result<(), EscalationReason> {
    if let Some(weakest) = intents
        .iter()
        .filter(|intent| intent.confidence < floor)
        .min_by(|a, b| a.confidence.total_cmp(&b.confidence))
    {
        return Err(EscalationReason::LowConfidence {
            member: weakest.member.clone(),
            confidence: weakest.confidence,
        });
    }

    let mut by_subject: BTreeMap<&str, Vec<(&ChangeSetId, &str)>> = BTreeMap::new();
    for intent in intents {
        for constraint in &intent.hard_constraints {
            by_subject
                .entry(constraint.subject.as_str())
                .or_default()
                .push((&intent.member, constraint.requirement.as_str()));
        }
    }

    for (subject, claims) in by_subject {
        let Some((_, first)) = claims.first() else {
            continue;
        };
        if claims.iter().any(|(_, requirement)| requirement != first) {
            let mut members: Vec<ChangeSetId> = claims.iter().map(|(member, _)| (*member).clone()).collect();
            members.sort();
            members.dedup();
            if members.len() > 1 {
                return Err(EscalationReason::ConflictingIntent {
                    subject: subject.to_string(),
                    members,
                });
            }
        }
    }
    Ok(())
}
