use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ScoringWeights;
use crate::exec::{targeted_filter, TestFilter};
use crate::oracle::SynthesizedTest;

use super::runner::{Halt, ResolutionPipeline};
use super::{Candidate, PipelineStage, ResolutionContext, ValidationScores, ValidationTier};

/// Weighted sum of the sub-scores minus the flaky penalty
pub fn total_score(scores: &ValidationScores, weights: &ScoringWeights, flaky_penalty: f64) -> f64 {
    let executed = scores.tests_passed as usize + scores.tests_failed.len() + scores.flaky_failures.len();
    let tests = if executed == 0 {
        if scores.build_passed {
            1.0
        } else {
            0.0
        }
    } else {
        f64::from(scores.tests_passed) / executed as f64
    };
    let tests = if scores.tests_failed.is_empty() && scores.build_passed {
        tests
    } else {
        tests.min(0.5)
    };

    let total = weights.tests * tests
        + weights.lint * scores.lint_score
        + weights.correctness * scores.correctness
        + weights.simplicity * scores.simplicity
        + weights.convention * scores.convention
        + weights.intent_satisfaction * scores.intent_satisfaction
        - flaky_penalty * scores.flaky_failures.len() as f64;
    total.max(0.0)
}

fn reached(candidate: &Candidate) -> Option<ValidationTier> {
    candidate.scores.eliminated_at
}

/// Validated candidates first, then by how far the others got, then by score.
/// Equal scores fall back to the strategy label so ranking is stable.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.passed()
            .cmp(&a.passed())
            .then_with(|| reached(b).cmp(&reached(a)))
            .then_with(|| b.total_score.partial_cmp(&a.total_score).unwrap_or(Ordering::Equal))
            .then_with(|| a.strategy.label().cmp(&b.strategy.label()))
    });
    candidates
}

fn first_line(output: &str) -> String {
    output.lines().find(|l| !l.trim().is_empty()).unwrap_or("no output").to_string()
}

impl ResolutionPipeline {
    /// Run the tiers cheapest first. A failed tier eliminates the candidate;
    /// survivors are critiqued and scored.
    pub(super) async fn validate(
        &self,
        context: &ResolutionContext,
        mut candidates: Vec<Candidate>,
        synthesized: &[SynthesizedTest],
        guard: &crate::budget::RunGuard,
    ) -> Result<Vec<Candidate>, Halt> {
        let stage = PipelineStage::Validation;
        let settings = &self.settings;
        let full_suite = !context.high_risk_flags().is_empty();

        for candidate in candidates.iter_mut() {
            self.gate(guard)?;
            let report = self.build(stage, &candidate.revision).await?;
            candidate.scores.build_passed = report.passed;
            if !report.passed {
                candidate.scores.eliminated_at = Some(ValidationTier::Build);
                candidate.scores.diagnostics.push(format!("build: {}", first_line(&report.output)));
            }
        }

        for candidate in candidates.iter_mut().filter(|c| c.passed()) {
            self.gate(guard)?;
            let report = self.lint(stage, &candidate.revision).await?;
            candidate.scores.lint_score = report.score;
            if report.score < settings.min_lint_score {
                candidate.scores.eliminated_at = Some(ValidationTier::Lint);
                candidate
                    .scores
                    .diagnostics
                    .push(format!("lint: score {:.2} with {} warnings", report.score, report.warnings));
            }
        }

        let contested = context.contested_paths();
        let synthesized_names: Vec<String> = synthesized.iter().map(|t| t.name.clone()).collect();
        for candidate in candidates.iter_mut().filter(|c| c.passed()) {
            let touched: BTreeSet<String> = candidate.patch.paths().union(&contested).cloned().collect();
            let mut names = targeted_filter(&touched);
            names.extend(synthesized_names.iter().cloned());
            names.sort();
            names.dedup();
            if names.is_empty() {
                continue;
            }
            self.gate(guard)?;
            let timeout = Duration::from_secs(settings.targeted_test_timeout_seconds);
            self.run_tests(candidate, TestFilter::Named(names), timeout, ValidationTier::TargetedTests)
                .await?;
        }

        if full_suite {
            for candidate in candidates.iter_mut().filter(|c| c.passed()) {
                self.gate(guard)?;
                let timeout = Duration::from_secs(settings.full_suite_timeout_seconds);
                self.run_tests(candidate, TestFilter::All, timeout, ValidationTier::FullSuite)
                    .await?;
                candidate.scores.full_suite_run = true;
            }
        }

        for candidate in candidates.iter_mut().filter(|c| c.passed()) {
            self.gate(guard)?;
            let critique = {
                let strategy = &candidate.strategy;
                let patch = &candidate.patch;
                self.ask_oracle(stage, "critique", || self.oracle.critique(context, strategy, patch))
                    .await?
                    .clamped()
            };
            candidate.scores.correctness = critique.correctness;
            candidate.scores.simplicity = critique.simplicity;
            candidate.scores.convention = critique.convention;
            candidate.scores.intent_satisfaction = critique.intent_satisfaction;
        }

        for candidate in candidates.iter_mut() {
            candidate.total_score = total_score(&candidate.scores, &settings.scoring, settings.flaky_penalty);
            debug!(
                strategy = %candidate.strategy,
                score = candidate.total_score,
                eliminated_at = ?candidate.scores.eliminated_at,
                "Candidate validated"
            );
        }
        let ranked = rank(candidates);
        info!(
            cluster = %context.cluster_id,
            validated = ranked.iter().filter(|c| c.passed()).count(),
            total = ranked.len(),
            "Validation finished"
        );
        Ok(ranked)
    }

    /// Known-flaky failures are retried once; a second failure costs score only
    async fn run_tests(
        &self,
        candidate: &mut Candidate,
        filter: TestFilter,
        timeout: Duration,
        tier: ValidationTier,
    ) -> Result<(), Halt> {
        let stage = PipelineStage::Validation;
        let report = self.test(stage, &candidate.revision, &filter, timeout).await?;
        candidate.scores.tests_passed += report.passed;

        let (flaky, real): (Vec<String>, Vec<String>) = report
            .failed
            .into_iter()
            .partition(|name| self.settings.known_flaky_tests.contains(name));

        if !flaky.is_empty() {
            let retry = self
                .test(stage, &candidate.revision, &TestFilter::Named(flaky), timeout)
                .await?;
            candidate.scores.tests_passed += retry.passed;
            candidate.scores.flaky_failures.extend(retry.failed);
        }

        if !real.is_empty() {
            candidate.scores.eliminated_at = Some(tier);
            candidate
                .scores
                .diagnostics
                .push(format!("{tier}: failing {}", real.join(", ")));
            candidate.scores.tests_failed.extend(real);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Strategy;
    use crate::vcs::{Patch, Revision};

    fn candidate(strategy: Strategy, scores: ValidationScores) -> Candidate {
        let total = total_score(&scores, &ScoringWeights::default(), 0.05);
        Candidate {
            strategy,
            patch: Patch::new(),
            revision: Revision::new("r"),
            summary: String::new(),
            deferred_files: BTreeSet::new(),
            scores,
            total_score: total,
        }
    }

    fn clean(quality: f64) -> ValidationScores {
        ValidationScores {
            build_passed: true,
            lint_score: 1.0,
            tests_passed: 4,
            correctness: quality,
            simplicity: quality,
            convention: quality,
            intent_satisfaction: quality,
            ..Default::default()
        }
    }

    #[test]
    fn test_flaky_failures_cost_score() {
        let steady = clean(0.8);
        let mut flaky = clean(0.8);
        flaky.flaky_failures = vec!["net_smoke".to_string()];
        let weights = ScoringWeights::default();
        assert!(total_score(&flaky, &weights, 0.05) < total_score(&steady, &weights, 0.05));
    }

    #[test]
    fn test_validated_candidates_rank_above_eliminated_ones() {
        let mut broken = clean(1.0);
        broken.eliminated_at = Some(ValidationTier::TargetedTests);
        let ranked = rank(vec![
            candidate(Strategy::ConventionPrimary, broken),
            candidate(Strategy::MinimalMerge, clean(0.5)),
            candidate(Strategy::FreshSynthesis, clean(0.9)),
        ]);
        let order: Vec<Strategy> = ranked.into_iter().map(|c| c.strategy).collect();
        assert_eq!(
            order,
            vec![Strategy::FreshSynthesis, Strategy::MinimalMerge, Strategy::ConventionPrimary]
        );
    }

    #[test]
    fn test_equal_scores_rank_by_label() {
        let ranked = rank(vec![
            candidate(Strategy::MinimalMerge, clean(0.7)),
            candidate(Strategy::ConventionPrimary, clean(0.7)),
        ]);
        assert_eq!(ranked[0].strategy, Strategy::ConventionPrimary);
    }
}
