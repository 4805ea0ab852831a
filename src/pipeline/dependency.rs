//! Manifest resolution for dependency-only conflicts
//!
//! When members bump the same package, the higher of two compatible versions
//! wins. Compatibility follows caret rules: same major, or same minor while
//! the major is zero.

use semver::Version;
use std::collections::BTreeMap;

use crate::classify::manifest::{self, LineKeys, ManifestError, ManifestKind};
use crate::classify::structural;
use crate::registry::ChangeSetId;

use super::ContestedFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestResolution {
    Resolved(String),
    /// Versions agree but the file still needs reasoning to merge
    Unmerged,
    Incompatible { package: String, requirements: Vec<String> },
}

/// Version named by a requirement string such as `^1.2`, `==2.31.0` or `1.0.150`
pub fn requirement_version(requirement: &str) -> Option<Version> {
    let trimmed = requirement
        .trim()
        .trim_start_matches(|c: char| matches!(c, '^' | '~' | '=' | '>' | '<' | 'v' | ' '));
    let core: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts: Vec<&str> = core.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

fn compatible(a: &Version, b: &Version) -> bool {
    a.major == b.major && (a.major > 0 || a.minor == b.minor)
}

/// The requirement every member can live with, or `None` when there is none
pub fn pick_requirement(requirements: &[&str]) -> Option<String> {
    let mut best: Option<(Version, &str)> = None;
    let mut first: Option<Version> = None;
    for requirement in requirements {
        let version = requirement_version(requirement)?;
        match &first {
            Some(anchor) if !compatible(anchor, &version) => return None,
            Some(_) => {}
            None => first = Some(version.clone()),
        }
        if best.as_ref().is_none_or(|(current, _)| version > *current) {
            best = Some((version, requirement));
        }
    }
    best.map(|(_, requirement)| requirement.to_string())
}

/// Swap `from` for `to` on the line that declares `key`
fn rewrite(kind: ManifestKind, content: &str, key: &str, from: &str, to: &str) -> String {
    let mut keys = LineKeys::new(kind);
    let mut out: Vec<String> = Vec::new();
    for line in content.lines() {
        if keys.next(line).as_deref() == Some(key) && line.contains(from) {
            out.push(line.replacen(from, to, 1));
        } else {
            out.push(line.to_string());
        }
    }
    let mut text = out.join("\n");
    if content.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Settle every package the members changed differently, then merge the
/// aligned versions structurally
pub fn resolve_manifest(kind: ManifestKind, file: &ContestedFile) -> Result<ManifestResolution, ManifestError> {
    let base = file.base.as_deref();
    let mut changes: BTreeMap<String, BTreeMap<ChangeSetId, Option<String>>> = BTreeMap::new();
    for (member, version) in &file.versions {
        for (key, requirement) in manifest::changed_requirements(kind, base, version.as_deref())? {
            changes.entry(key).or_default().insert(member.clone(), requirement);
        }
    }

    let mut aligned: BTreeMap<ChangeSetId, Option<String>> = file.versions.clone();
    for (key, by_member) in changes {
        let package = manifest::package_name(&key).to_string();
        let mut requirements: Vec<&str> = Vec::new();
        let mut removed = false;
        for requirement in by_member.values() {
            match requirement {
                Some(r) if !requirements.contains(&r.as_str()) => requirements.push(r.as_str()),
                Some(_) => {}
                None => removed = true,
            }
        }
        if requirements.len() < 2 && !(removed && !requirements.is_empty()) {
            continue;
        }
        let winner = match (removed, pick_requirement(&requirements)) {
            (false, Some(winner)) => winner,
            _ => {
                let mut listed: Vec<String> = requirements.iter().map(|r| r.to_string()).collect();
                if removed {
                    listed.push("removal".to_string());
                }
                return Ok(ManifestResolution::Incompatible {
                    package,
                    requirements: listed,
                });
            }
        };
        for (member, requirement) in &by_member {
            let (Some(requirement), Some(Some(content))) = (requirement, aligned.get(member)) else {
                continue;
            };
            if requirement != &winner {
                let rewritten = rewrite(kind, content, &key, requirement, &winner);
                aligned.insert(member.clone(), Some(rewritten));
            }
        }
    }

    let versions: Vec<Option<&str>> = aligned.values().map(|v| v.as_deref()).collect();
    Ok(match structural::resolve_many(base, &versions) {
        Some(content) => ManifestResolution::Resolved(content),
        None => ManifestResolution::Unmerged,
    })
}
