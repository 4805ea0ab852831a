use std::collections::BTreeSet;
use tracing::debug;

use crate::classify::structural;
use crate::oracle::{InteractionPoint, SynthesizedTest};
use crate::vcs::Patch;

use super::harmonize::SignatureConflict;
use super::ResolutionContext;

pub fn is_test_path(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    path.starts_with("tests/")
        || path.contains("/tests/")
        || path.contains("__tests__/")
        || file.ends_with("_test.rs")
        || file.ends_with("_test.go")
        || file.ends_with("_test.py")
        || file.starts_with("test_")
        || file.contains(".test.")
        || file.contains(".spec.")
}

/// Contested test files merged structurally. Files that need reasoning are
/// left for the candidates.
pub fn merge_member_tests(context: &ResolutionContext) -> Patch {
    let mut merged = Patch::new();
    for file in context.contested.iter().filter(|f| is_test_path(&f.path)) {
        let versions: Vec<Option<&str>> = file.versions.values().map(|v| v.as_deref()).collect();
        if let Some(content) = structural::resolve_many(file.base.as_deref(), &versions) {
            merged.write(file.path.clone(), content);
        } else {
            debug!(path = %file.path, "Member tests need a candidate to merge");
        }
    }
    merged
}

/// Places where the members' changes meet: contested files and harmonized symbols
pub fn interaction_points(context: &ResolutionContext, conflicts: &[SignatureConflict]) -> Vec<InteractionPoint> {
    let mut points: Vec<InteractionPoint> = context
        .contested
        .iter()
        .filter(|file| !is_test_path(&file.path))
        .map(|file| InteractionPoint {
            path: file.path.clone(),
            symbol: None,
            members: file.versions.keys().cloned().collect(),
        })
        .collect();
    for conflict in conflicts {
        for path in conflict.paths() {
            points.push(InteractionPoint {
                path,
                symbol: Some(conflict.symbol.clone()),
                members: conflict.definitions.keys().cloned().collect(),
            });
        }
    }
    points
}

/// Keep at most `limit` new tests, never overwrite a member's file, and flag
/// every survivor for review
pub fn cap_tests(tests: Vec<SynthesizedTest>, limit: usize, context: &ResolutionContext) -> Vec<SynthesizedTest> {
    let taken: BTreeSet<String> = context
        .members
        .iter()
        .flat_map(|m| m.patch.paths())
        .collect();
    let mut names = BTreeSet::new();
    let mut paths = BTreeSet::new();

    let mut kept = Vec::new();
    for mut test in tests {
        if kept.len() == limit {
            break;
        }
        if taken.contains(&test.path) || !names.insert(test.name.clone()) || !paths.insert(test.path.clone()) {
            continue;
        }
        test.needs_review = true;
        kept.push(test);
    }
    kept
}
