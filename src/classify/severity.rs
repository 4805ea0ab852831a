use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::{ConfigError, RiskPathConfig};
use crate::registry::RiskFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Critical conflicts are architectural and get a fresh-synthesis candidate
    pub fn is_architectural(self) -> bool {
        self == Severity::Critical
    }
}

/// Tags paths with risk flags from configured patterns
#[derive(Debug, Clone)]
pub struct RiskTagger {
    rules: Vec<(RiskFlag, Regex)>,
}

impl RiskTagger {
    pub fn new(settings: &RiskPathConfig) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        for (flag, field, patterns) in [
            (RiskFlag::Security, "classifier.risk_paths.security", &settings.security),
            (RiskFlag::Auth, "classifier.risk_paths.auth", &settings.auth),
            (RiskFlag::Schema, "classifier.risk_paths.schema", &settings.schema),
            (
                RiskFlag::PublicInterface,
                "classifier.risk_paths.public_interface",
                &settings.public_interface,
            ),
        ] {
            for pattern in patterns {
                let regex = Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                    field: field.to_string(),
                    source,
                })?;
                rules.push((flag, regex));
            }
        }
        Ok(Self { rules })
    }

    pub fn flags_for(&self, path: &str) -> BTreeSet<RiskFlag> {
        self.rules
            .iter()
            .filter(|(_, regex)| regex.is_match(path))
            .map(|(flag, _)| *flag)
            .collect()
    }

    pub fn flags_for_all<'a>(&self, paths: impl IntoIterator<Item = &'a String>) -> BTreeSet<RiskFlag> {
        paths.into_iter().flat_map(|p| self.flags_for(p)).collect()
    }
}

/// Additive severity score over risk tags, cluster size and semantic failures
pub fn assess(flags: &BTreeSet<RiskFlag>, members: usize, semantic_failure: bool) -> Severity {
    let mut score = 0u32;
    for flag in flags {
        score += match flag {
            RiskFlag::Security | RiskFlag::Auth | RiskFlag::Schema => 2,
            RiskFlag::PublicInterface => 1,
        };
    }
    if members >= 5 {
        score += 2;
    } else if members >= 3 {
        score += 1;
    }
    if semantic_failure {
        score += 1;
    }

    match score {
        0 => Severity::Low,
        1..=2 => Severity::Medium,
        3..=4 => Severity::High,
        _ => Severity::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns_tag_paths() {
        let tagger = RiskTagger::new(&RiskPathConfig::default()).unwrap();
        assert!(tagger.flags_for("src/auth/session.rs").contains(&RiskFlag::Auth));
        assert!(tagger.flags_for("db/migrations/001_init.sql").contains(&RiskFlag::Schema));
        assert!(tagger.flags_for("src/lib.rs").contains(&RiskFlag::PublicInterface));
        assert!(tagger.flags_for("src/util/strings.rs").is_empty());
    }

    #[test]
    fn test_severity_grows_with_risk_and_size() {
        let none = BTreeSet::new();
        assert_eq!(assess(&none, 2, false), Severity::Low);
        assert_eq!(assess(&none, 3, true), Severity::Medium);

        let schema: BTreeSet<_> = [RiskFlag::Schema].into_iter().collect();
        assert_eq!(assess(&schema, 3, false), Severity::High);

        let wide: BTreeSet<_> = [RiskFlag::Security, RiskFlag::Schema].into_iter().collect();
        assert_eq!(assess(&wide, 5, true), Severity::Critical);
        assert!(assess(&wide, 5, true).is_architectural());
    }
}
