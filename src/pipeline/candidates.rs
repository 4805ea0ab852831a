use crate::classify::Severity;
use crate::registry::ChangeSetId;
use crate::vcs::Patch;

use super::Strategy;

/// Strategies for stage 6. Fresh synthesis leads for architectural
/// conflicts; member-primary strategies fill the remaining slots in member
/// order. When that leaves fewer than `min`, the plan is topped up with a
/// minimal merge and then fresh synthesis.
pub fn plan_strategies(members: &[ChangeSetId], severity: Severity, min: usize, max: usize) -> Vec<Strategy> {
    let max = max.max(min).max(2);
    let mut strategies = vec![Strategy::ConventionPrimary];
    if severity.is_architectural() {
        strategies.push(Strategy::FreshSynthesis);
    }

    let mut sorted = members.to_vec();
    sorted.sort();
    for member in sorted {
        if strategies.len() >= max {
            break;
        }
        strategies.push(Strategy::MemberPrimary(member));
    }

    for filler in [Strategy::MinimalMerge, Strategy::FreshSynthesis] {
        if strategies.len() >= min {
            break;
        }
        if !strategies.contains(&filler) {
            strategies.push(filler);
        }
    }
    strategies
}

/// The highest similarity between `draft` and any accepted patch
pub fn max_similarity<'a>(draft: &Patch, accepted: impl IntoIterator<Item = &'a Patch>) -> f64 {
    accepted
        .into_iter()
        .map(|other| draft.similarity(other))
        .fold(0.0, f64::max)
}

pub fn diversity_hint(strategy: &Strategy, attempt: u32) -> String {
    format!(
        "previous {} draft duplicated another candidate; take a different approach (attempt {})",
        strategy.label(),
        attempt + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ChangeSetId> {
        names.iter().map(|n| ChangeSetId::new(*n)).collect()
    }

    #[test]
    fn test_two_members_get_three_strategies() {
        let plan = plan_strategies(&ids(&["b", "a"]), Severity::Medium, 3, 5);
        assert_eq!(
            plan,
            vec![
                Strategy::ConventionPrimary,
                Strategy::MemberPrimary(ChangeSetId::new("a")),
                Strategy::MemberPrimary(ChangeSetId::new("b")),
            ]
        );
    }

    #[test]
    fn test_fresh_synthesis_only_for_architectural_conflicts() {
        let critical = plan_strategies(&ids(&["a", "b"]), Severity::Critical, 3, 5);
        assert!(critical.contains(&Strategy::FreshSynthesis));
        let high = plan_strategies(&ids(&["a", "b"]), Severity::High, 3, 5);
        assert!(!high.contains(&Strategy::FreshSynthesis));
    }

    #[test]
    fn test_plan_is_filled_up_to_the_minimum() {
        let plan = plan_strategies(&ids(&["a", "b"]), Severity::Medium, 4, 5);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[3], Strategy::MinimalMerge);

        let plan = plan_strategies(&ids(&["a", "b"]), Severity::Medium, 5, 5);
        assert_eq!(plan.len(), 5);
        assert_eq!(plan[4], Strategy::FreshSynthesis);
    }

    #[test]
    fn test_many_members_are_capped() {
        let plan = plan_strategies(&ids(&["a", "b", "c", "d", "e", "f"]), Severity::Critical, 3, 5);
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn test_similarity_against_nothing_is_zero() {
        let mut draft = Patch::new();
        draft.write("a.rs", "x\n");
        assert_eq!(max_similarity(&draft, std::iter::empty()), 0.0);
        assert_eq!(max_similarity(&draft, [&draft.clone()]), 1.0);
    }
}
