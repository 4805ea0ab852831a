// Dependency manifest parsing and version alignment across change sets

use merge_steward::classify::manifest::{self, ManifestKind};
use merge_steward::pipeline::dependency::{pick_requirement, requirement_version, resolve_manifest, ManifestResolution};
use merge_steward::pipeline::ContestedFile;
use merge_steward::registry::ChangeSetId;
use std::collections::BTreeMap;

fn cargo_manifest(serde: &str) -> String {
    format!("[package]\nname = \"app\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = \"{serde}\"\n")
}

fn contested(path: &str, base: &str, versions: &[(&str, &str)]) -> ContestedFile {
    ContestedFile {
        path: path.to_string(),
        base: Some(base.to_string()),
        versions: versions
            .iter()
            .map(|(id, content)| (ChangeSetId::new(*id), Some(content.to_string())))
            .collect::<BTreeMap<_, _>>(),
    }
}

#[test]
fn test_compatible_bumps_settle_on_the_higher_version() {
    let file = contested(
        "Cargo.toml",
        &cargo_manifest("1.0.100"),
        &[("agent/a", &cargo_manifest("1.0.150")), ("agent/b", &cargo_manifest("1.0.180"))],
    );

    match resolve_manifest(ManifestKind::Cargo, &file).unwrap() {
        ManifestResolution::Resolved(content) => {
            assert!(content.contains("serde = \"1.0.180\""));
            assert!(!content.contains("1.0.150"));
        }
        other => panic!("expected a resolved manifest, got {other:?}"),
    }
}

#[test]
fn test_major_version_split_is_incompatible() {
    let file = contested(
        "Cargo.toml",
        &cargo_manifest("1.0.100"),
        &[("agent/a", &cargo_manifest("1.0.150")), ("agent/b", &cargo_manifest("2.0.0"))],
    );

    match resolve_manifest(ManifestKind::Cargo, &file).unwrap() {
        ManifestResolution::Incompatible { package, requirements } => {
            assert_eq!(package, "serde");
            assert_eq!(requirements.len(), 2);
        }
        other => panic!("expected an incompatible manifest, got {other:?}"),
    }
}

#[test]
fn test_caret_rules_for_zero_major_versions() {
    assert_eq!(pick_requirement(&["^0.3.1", "^0.3.4"]), Some("^0.3.4".to_string()));
    assert_eq!(pick_requirement(&["0.3", "0.4"]), None);
    assert_eq!(pick_requirement(&["1.2", "1.9.3"]), Some("1.9.3".to_string()));
    assert_eq!(pick_requirement(&["not-a-version", "1.0"]), None);
}

#[test]
fn test_requirement_versions_are_normalized() {
    assert_eq!(requirement_version("==2.31.0").map(|v| v.to_string()), Some("2.31.0".to_string()));
    assert_eq!(requirement_version("^1.2").map(|v| v.to_string()), Some("1.2.0".to_string()));
    assert_eq!(requirement_version(">=3").map(|v| v.to_string()), Some("3.0.0".to_string()));
    assert!(requirement_version("*").is_none());
}

#[test]
fn test_divergent_requirements_conflict_but_identical_ones_do_not() {
    let base = cargo_manifest("1.0.100");
    let ours = cargo_manifest("1.0.150");
    let theirs = cargo_manifest("1.0.180");

    let conflicts = manifest::conflicts(ManifestKind::Cargo, Some(&base), Some(&ours), Some(&theirs)).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].key, "dependencies/serde");
    assert_eq!(conflicts[0].base.as_deref(), Some("1.0.100"));

    let agreed = manifest::conflicts(ManifestKind::Cargo, Some(&base), Some(&ours), Some(&ours)).unwrap();
    assert!(agreed.is_empty());
}

#[test]
fn test_pip_names_are_normalized_and_comments_ignored() {
    let requirements = manifest::parse(
        ManifestKind::Pip,
        "# pinned\nRequests==2.31.0\nmy_lib[extra] >=1.2  # note\n-r other.txt\n",
    )
    .unwrap();
    assert_eq!(requirements.get("requirements/requests").map(String::as_str), Some("==2.31.0"));
    assert_eq!(requirements.get("requirements/my-lib").map(String::as_str), Some(">=1.2"));
    assert_eq!(requirements.len(), 2);
}

#[test]
fn test_npm_removal_is_reported_as_change() {
    let base = r#"{"dependencies": {"left-pad": "^1.3.0", "react": "^18.2.0"}}"#;
    let head = r#"{"dependencies": {"react": "^18.3.0"}}"#;
    let changed = manifest::changed_requirements(ManifestKind::Npm, Some(base), Some(head)).unwrap();
    assert_eq!(changed.get("dependencies/left-pad"), Some(&None));
    assert_eq!(changed.get("dependencies/react"), Some(&Some("^18.3.0".to_string())));
    assert_eq!(manifest::manifest_kind("web/package.json"), Some(ManifestKind::Npm));
}
