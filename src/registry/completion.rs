use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CompletionConfig, ConfigError};
use crate::vcs::CommitInfo;

use super::types::ChangeSetHint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompletionSignal {
    ExplicitMarker,
    TestsPassing,
    CommitConvention { message: String },
    Inactivity { idle_minutes: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionAssessment {
    pub score: f64,
    pub complete: bool,
    pub stale: bool,
    pub signals: Vec<CompletionSignal>,
}

/// Weighs independent "done" signals. A change set is complete only when
/// several of them agree.
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    settings: CompletionConfig,
    convention: Regex,
}

impl CompletionDetector {
    pub fn new(settings: &CompletionConfig) -> Result<Self, ConfigError> {
        let convention = Regex::new(&settings.convention_pattern).map_err(|source| ConfigError::Pattern {
            field: "completion.convention_pattern".to_string(),
            source,
        })?;
        Ok(Self {
            settings: settings.clone(),
            convention,
        })
    }

    pub fn collect_signals(
        &self,
        hint: &ChangeSetHint,
        commits: &[CommitInfo],
        last_activity: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<CompletionSignal> {
        let mut signals = Vec::new();
        if hint.completion_marker {
            signals.push(CompletionSignal::ExplicitMarker);
        }
        if hint.tests_passed == Some(true) {
            signals.push(CompletionSignal::TestsPassing);
        }
        if let Some(last) = commits.last() {
            if self.convention.is_match(&last.message) {
                signals.push(CompletionSignal::CommitConvention {
                    message: last.message.lines().next().unwrap_or_default().to_string(),
                });
            }
        }
        let idle = now - last_activity;
        if idle >= Duration::minutes(self.settings.inactivity_minutes) {
            signals.push(CompletionSignal::Inactivity {
                idle_minutes: idle.num_minutes(),
            });
        }
        signals
    }

    fn weight(&self, signal: &CompletionSignal) -> f64 {
        match signal {
            CompletionSignal::ExplicitMarker => self.settings.explicit_marker_weight,
            CompletionSignal::TestsPassing => self.settings.tests_passing_weight,
            CompletionSignal::CommitConvention { .. } => self.settings.commit_convention_weight,
            CompletionSignal::Inactivity { .. } => self.settings.inactivity_weight,
        }
    }

    pub fn score(&self, signals: &[CompletionSignal]) -> f64 {
        let mut seen = Vec::new();
        let mut total = 0.0;
        for signal in signals {
            let kind = std::mem::discriminant(signal);
            if !seen.contains(&kind) {
                seen.push(kind);
                total += self.weight(signal);
            }
        }
        total
    }

    pub fn assess(
        &self,
        signals: Vec<CompletionSignal>,
        last_activity: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CompletionAssessment {
        let score = self.score(&signals);
        CompletionAssessment {
            score,
            complete: score >= self.settings.threshold,
            stale: now - last_activity >= Duration::hours(self.settings.stale_after_hours),
            signals,
        }
    }
}
