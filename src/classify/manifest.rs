//! Dependency manifest parsing
//!
//! Requirements are keyed `section/name` so that a package listed both as a
//! regular and as a dev dependency is tracked separately.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestKind {
    Cargo,
    Npm,
    Pip,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed {kind:?} manifest: {reason}")]
    Malformed { kind: ManifestKind, reason: String },
}

pub type Requirements = BTreeMap<String, String>;

const CARGO_SECTIONS: [&str; 3] = ["dependencies", "dev-dependencies", "build-dependencies"];
const NPM_SECTIONS: [&str; 4] = [
    "dependencies",
    "devDependencies",
    "peerDependencies",
    "optionalDependencies",
];

static PIP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9_.\-]*)(\[[^\]]*\])?\s*(.*)$").expect("valid requirement pattern")
});

static TOML_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?([A-Za-z0-9_\-]+)"?\s*(?:\.[A-Za-z0-9_\-."]+)?\s*="#).expect("valid key pattern")
});

static JSON_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*"([^"]+)"\s*:\s*([{"])"#).expect("valid key pattern"));

pub fn manifest_kind(path: &str) -> Option<ManifestKind> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name {
        "Cargo.toml" => Some(ManifestKind::Cargo),
        "package.json" => Some(ManifestKind::Npm),
        name if name.starts_with("requirements") && name.ends_with(".txt") => Some(ManifestKind::Pip),
        _ => None,
    }
}

pub fn is_manifest(path: &str) -> bool {
    manifest_kind(path).is_some()
}

fn malformed(kind: ManifestKind, reason: impl ToString) -> ManifestError {
    ManifestError::Malformed {
        kind,
        reason: reason.to_string(),
    }
}

fn cargo_requirement(value: &toml::Value) -> String {
    match value {
        toml::Value::String(version) => version.clone(),
        toml::Value::Table(table) => match table.get("version") {
            Some(toml::Value::String(version)) => version.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

pub fn parse(kind: ManifestKind, content: &str) -> Result<Requirements, ManifestError> {
    let mut requirements = Requirements::new();
    match kind {
        ManifestKind::Cargo => {
            let table: toml::Table = toml::from_str(content).map_err(|e| malformed(kind, e))?;
            let workspace = table
                .get("workspace")
                .and_then(|w| w.as_table())
                .and_then(|w| w.get("dependencies"))
                .and_then(|d| d.as_table());
            if let Some(deps) = workspace {
                for (name, value) in deps {
                    requirements.insert(format!("workspace.dependencies/{name}"), cargo_requirement(value));
                }
            }
            for section in CARGO_SECTIONS {
                if let Some(deps) = table.get(section).and_then(|d| d.as_table()) {
                    for (name, value) in deps {
                        requirements.insert(format!("{section}/{name}"), cargo_requirement(value));
                    }
                }
            }
        }
        ManifestKind::Npm => {
            let value: serde_json::Value = serde_json::from_str(content).map_err(|e| malformed(kind, e))?;
            for section in NPM_SECTIONS {
                if let Some(deps) = value.get(section).and_then(|d| d.as_object()) {
                    for (name, version) in deps {
                        let version = version
                            .as_str()
                            .ok_or_else(|| malformed(kind, format!("{section}.{name} is not a string")))?;
                        requirements.insert(format!("{section}/{name}"), version.to_string());
                    }
                }
            }
        }
        ManifestKind::Pip => {
            for (number, raw) in content.lines().enumerate() {
                let line = raw.split('#').next().unwrap_or_default().trim();
                if line.is_empty() || line.starts_with('-') {
                    continue;
                }
                let captures = PIP_LINE
                    .captures(line)
                    .ok_or_else(|| malformed(kind, format!("line {} is not a requirement", number + 1)))?;
                let name = captures[1].to_lowercase().replace('_', "-");
                let spec = captures.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
                requirements.insert(format!("requirements/{name}"), spec.to_string());
            }
        }
    }
    Ok(requirements)
}

/// Walks a manifest line by line and names the requirement key each line
/// declares, in the same `section/name` form [`parse`] produces
pub struct LineKeys {
    kind: ManifestKind,
    section: String,
}

impl LineKeys {
    pub fn new(kind: ManifestKind) -> Self {
        Self {
            kind,
            section: String::new(),
        }
    }

    fn is_cargo_section(section: &str) -> bool {
        section == "workspace.dependencies" || CARGO_SECTIONS.contains(&section)
    }

    pub fn next(&mut self, line: &str) -> Option<String> {
        match self.kind {
            ManifestKind::Cargo => {
                let trimmed = line.trim();
                if trimmed.starts_with('[') {
                    self.section = trimmed.trim_matches(|c| c == '[' || c == ']').trim().to_string();
                    return None;
                }
                let name = TOML_KEY.captures(line)?.get(1)?.as_str();
                if Self::is_cargo_section(&self.section) {
                    return Some(format!("{}/{name}", self.section));
                }
                // `[dependencies.serde]` followed by `version = "..."`
                let (prefix, package) = self.section.rsplit_once('.')?;
                (Self::is_cargo_section(prefix) && name == "version").then(|| format!("{prefix}/{package}"))
            }
            ManifestKind::Npm => {
                let captures = JSON_KEY.captures(line)?;
                let name = captures.get(1)?.as_str();
                if &captures[2] == "{" {
                    self.section = name.to_string();
                    return None;
                }
                NPM_SECTIONS
                    .contains(&self.section.as_str())
                    .then(|| format!("{}/{name}", self.section))
            }
            ManifestKind::Pip => {
                let stripped = line.split('#').next().unwrap_or_default().trim();
                if stripped.is_empty() || stripped.starts_with('-') {
                    return None;
                }
                let captures = PIP_LINE.captures(stripped)?;
                Some(format!("requirements/{}", captures[1].to_lowercase().replace('_', "-")))
            }
        }
    }
}

/// Package name without the section prefix
pub fn package_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Requirement changes from `base` to `head`; `None` marks a removal
pub fn changed_requirements(
    kind: ManifestKind,
    base: Option<&str>,
    head: Option<&str>,
) -> Result<BTreeMap<String, Option<String>>, ManifestError> {
    let before = base.map(|c| parse(kind, c)).transpose()?.unwrap_or_default();
    let after = head.map(|c| parse(kind, c)).transpose()?.unwrap_or_default();

    let mut changes = BTreeMap::new();
    for (key, requirement) in &after {
        if before.get(key) != Some(requirement) {
            changes.insert(key.clone(), Some(requirement.clone()));
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changes.insert(key.clone(), None);
        }
    }
    Ok(changes)
}

/// Package names whose requirement changed
pub fn changed_packages(
    kind: ManifestKind,
    base: Option<&str>,
    head: Option<&str>,
) -> Result<BTreeSet<String>, ManifestError> {
    Ok(changed_requirements(kind, base, head)?
        .keys()
        .map(|key| package_name(key).to_string())
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConflict {
    pub key: String,
    pub base: Option<String>,
    pub ours: Option<String>,
    pub theirs: Option<String>,
}

/// Packages both sides changed to different requirements
pub fn conflicts(
    kind: ManifestKind,
    base: Option<&str>,
    ours: Option<&str>,
    theirs: Option<&str>,
) -> Result<Vec<PackageConflict>, ManifestError> {
    let ours_changes = changed_requirements(kind, base, ours)?;
    let theirs_changes = changed_requirements(kind, base, theirs)?;
    let before = base.map(|c| parse(kind, c)).transpose()?.unwrap_or_default();

    Ok(ours_changes
        .iter()
        .filter_map(|(key, ours_req)| {
            let theirs_req = theirs_changes.get(key)?;
            (theirs_req != ours_req).then(|| PackageConflict {
                key: key.clone(),
                base: before.get(key).cloned(),
                ours: ours_req.clone(),
                theirs: theirs_req.clone(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_manifest_kinds() {
        assert_eq!(manifest_kind("Cargo.toml"), Some(ManifestKind::Cargo));
        assert_eq!(manifest_kind("crates/core/Cargo.toml"), Some(ManifestKind::Cargo));
        assert_eq!(manifest_kind("web/package.json"), Some(ManifestKind::Npm));
        assert_eq!(manifest_kind("requirements-dev.txt"), Some(ManifestKind::Pip));
        assert_eq!(manifest_kind("src/main.rs"), None);
    }

    #[test]
    fn test_parse_cargo_sections() {
        let content = r#"
[package]
name = "demo"

[dependencies]
serde = { version = "1.0.100", features = ["derive"] }
regex = "1.10"

[dev-dependencies]
tempfile = "3"
"#;
        let reqs = parse(ManifestKind::Cargo, content).unwrap();
        assert_eq!(reqs.get("dependencies/serde").map(String::as_str), Some("1.0.100"));
        assert_eq!(reqs.get("dependencies/regex").map(String::as_str), Some("1.10"));
        assert_eq!(reqs.get("dev-dependencies/tempfile").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_parse_pip_and_npm() {
        let pip = parse(ManifestKind::Pip, "# pinned\nRequests==2.31.0\nflask>=2.0  # web\n-r base.txt\n").unwrap();
        assert_eq!(pip.get("requirements/requests").map(String::as_str), Some("==2.31.0"));
        assert_eq!(pip.get("requirements/flask").map(String::as_str), Some(">=2.0"));

        let npm = parse(ManifestKind::Npm, r#"{"dependencies": {"react": "^18.2.0"}}"#).unwrap();
        assert_eq!(npm.get("dependencies/react").map(String::as_str), Some("^18.2.0"));
    }

    #[test]
    fn test_line_keys_follow_sections() {
        let content = "[dependencies]\nserde = \"1\"\nserde_json = { version = \"1\" }\n\n[dev-dependencies.tokio]\nversion = \"1\"\n";
        let mut keys = LineKeys::new(ManifestKind::Cargo);
        let found: Vec<Option<String>> = content.lines().map(|line| keys.next(line)).collect();
        assert_eq!(
            found,
            vec![
                None,
                Some("dependencies/serde".to_string()),
                Some("dependencies/serde_json".to_string()),
                None,
                None,
                Some("dev-dependencies/tokio".to_string()),
            ]
        );

        let mut keys = LineKeys::new(ManifestKind::Npm);
        assert_eq!(keys.next(r#"  "devDependencies": {"#), None);
        assert_eq!(keys.next(r#"    "jest": "^29.0.0","#), Some("devDependencies/jest".to_string()));

        let mut keys = LineKeys::new(ManifestKind::Pip);
        assert_eq!(keys.next("Flask_Login==0.6 # auth"), Some("requirements/flask-login".to_string()));
    }

    #[test]
    fn test_malformed_manifest_is_an_error() {
        assert!(parse(ManifestKind::Cargo, "[dependencies\nserde = ").is_err());
        assert!(parse(ManifestKind::Npm, "{not json").is_err());
    }

    #[test]
    fn test_conflicts_only_on_divergent_requirements() {
        let base = "[dependencies]\nserde = \"1.0.100\"\nregex = \"1.9\"\n";
        let ours = "[dependencies]\nserde = \"1.0.150\"\nregex = \"1.10\"\n";
        let theirs = "[dependencies]\nserde = \"1.0.190\"\nregex = \"1.10\"\n";

        let found = conflicts(ManifestKind::Cargo, Some(base), Some(ours), Some(theirs)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "dependencies/serde");
        assert_eq!(found[0].ours.as_deref(), Some("1.0.150"));
        assert_eq!(found[0].theirs.as_deref(), Some("1.0.190"));

        let packages = changed_packages(ManifestKind::Cargo, Some(base), Some(ours)).unwrap();
        assert!(packages.contains("serde") && packages.contains("regex"));
    }
}
