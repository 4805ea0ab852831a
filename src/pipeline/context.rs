use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::classify::{structural, symbols, Classification, Severity};
use crate::cluster::{Cluster, ClusterId};
use crate::registry::{ChangeSetId, RiskFlag};
use crate::vcs::{FileEdit, Patch, Revision, VcsError, VersionControl};

/// What one member changed, relative to the run's base
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub files_added: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_deleted: Vec<String>,
    /// Exported symbols defined in the member's changed files
    pub signatures: BTreeMap<String, String>,
    /// Symbols the member added or whose signature it changed
    pub changed_symbols: BTreeSet<String>,
    pub commit_subjects: Vec<String>,
    pub risk_flags: Vec<RiskFlag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberContext {
    pub id: ChangeSetId,
    pub branch: String,
    pub head: Revision,
    /// Where the member forked from the integration line
    pub fork_point: Revision,
    pub patch: Patch,
    pub summary: ChangeSummary,
}

/// A file more than one member wants to change differently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestedFile {
    pub path: String,
    /// Content at the run's base
    pub base: Option<String>,
    /// Each member's version; `None` when the member deletes the file
    pub versions: BTreeMap<ChangeSetId, Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndentStyle {
    Spaces(u8),
    Tabs,
}

/// Formatting habits observed in the base versions of the touched files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConventionSignals {
    pub indent: IndentStyle,
    pub trailing_newline: bool,
    pub max_line_length: usize,
}

impl Default for ConventionSignals {
    fn default() -> Self {
        Self {
            indent: IndentStyle::Spaces(4),
            trailing_newline: true,
            max_line_length: 100,
        }
    }
}

/// Everything later stages and the oracle may look at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionContext {
    pub cluster_id: ClusterId,
    pub base: Revision,
    pub members: Vec<MemberContext>,
    pub contested: Vec<ContestedFile>,
    /// Changes only one member makes, already reconciled with the base
    pub non_contested: Patch,
    pub conventions: ConventionSignals,
    pub classification: Classification,
    pub severity: Severity,
    pub risk_flags: BTreeSet<RiskFlag>,
    /// Exported signatures at the base, for the files the members touch
    pub base_signatures: BTreeMap<String, String>,
}

impl ResolutionContext {
    pub fn member(&self, id: &ChangeSetId) -> Option<&MemberContext> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn member_ids(&self) -> Vec<ChangeSetId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn contested_paths(&self) -> BTreeSet<String> {
        self.contested.iter().map(|f| f.path.clone()).collect()
    }

    pub fn high_risk_flags(&self) -> Vec<RiskFlag> {
        self.risk_flags.iter().copied().filter(|f| f.is_high_risk()).collect()
    }
}

fn conventions(contents: &[&str]) -> ConventionSignals {
    let mut signals = ConventionSignals::default();
    if contents.is_empty() {
        return signals;
    }

    let mut tabs = 0usize;
    let mut widths: BTreeMap<usize, usize> = BTreeMap::new();
    let mut trailing = 0usize;
    let mut longest = 0usize;
    for content in contents {
        if content.ends_with('\n') {
            trailing += 1;
        }
        for line in content.lines() {
            longest = longest.max(line.chars().count());
            if line.starts_with('\t') {
                tabs += 1;
            } else {
                let spaces = line.len() - line.trim_start_matches(' ').len();
                if spaces > 0 && spaces <= 8 && !line.trim().is_empty() {
                    *widths.entry(spaces).or_default() += 1;
                }
            }
        }
    }

    let spaced: usize = widths.values().sum();
    signals.indent = if tabs > spaced {
        IndentStyle::Tabs
    } else {
        let smallest = widths.keys().next().copied().unwrap_or(4);
        IndentStyle::Spaces(smallest.min(8) as u8)
    };
    signals.trailing_newline = trailing * 2 >= contents.len();
    signals.max_line_length = longest.max(80);
    signals
}

async fn summarize(
    vcs: &dyn VersionControl,
    fork_point: &Revision,
    head: &Revision,
    patch: &Patch,
    flags: Vec<RiskFlag>,
) -> Result<ChangeSummary, VcsError> {
    let mut summary = ChangeSummary {
        risk_flags: flags,
        ..Default::default()
    };
    for (path, edit) in &patch.files {
        match edit {
            FileEdit::Delete => summary.files_deleted.push(path.clone()),
            FileEdit::Write(content) => {
                let before = vcs.read_file(fork_point, path).await?;
                if before.is_some() {
                    summary.files_modified.push(path.clone());
                } else {
                    summary.files_added.push(path.clone());
                }
                summary.signatures.extend(symbols::extract_signatures(path, content));
                summary
                    .changed_symbols
                    .extend(symbols::changed_symbols(path, before.as_deref(), Some(content)));
            }
        }
    }
    summary.commit_subjects = vcs
        .commits_between(fork_point, head)
        .await?
        .into_iter()
        .map(|commit| commit.message.lines().next().unwrap_or_default().to_string())
        .collect();
    Ok(summary)
}

/// Gather member patches, split contested from uncontested files and read
/// conventions. Any error here is an input error for the run.
pub async fn assemble(vcs: &dyn VersionControl, cluster: &Cluster, base: &Revision) -> Result<ResolutionContext, VcsError> {
    let mut members = Vec::with_capacity(cluster.members.len());
    for change_set in &cluster.members {
        let head = change_set.head_revision.clone();
        let fork_point = vcs.merge_base(base, &head).await?;
        let patch = vcs.diff(&fork_point, &head).await?;
        let flags = change_set.risk_flags().into_iter().collect();
        let summary = summarize(vcs, &fork_point, &head, &patch, flags).await?;
        members.push(MemberContext {
            id: change_set.id.clone(),
            branch: change_set.branch.clone(),
            head,
            fork_point,
            patch,
            summary,
        });
    }

    let mut by_path: BTreeMap<String, BTreeMap<ChangeSetId, Option<String>>> = BTreeMap::new();
    for member in &members {
        for (path, edit) in &member.patch.files {
            by_path
                .entry(path.clone())
                .or_default()
                .insert(member.id.clone(), edit.content().map(str::to_string));
        }
    }

    let mut contested = Vec::new();
    let mut non_contested = Patch::new();
    let mut base_contents = Vec::new();
    let mut base_signatures = BTreeMap::new();
    for (path, versions) in by_path {
        let at_base = vcs.read_file(base, &path).await?;
        if let Some(content) = &at_base {
            base_signatures.extend(symbols::extract_signatures(&path, content));
            base_contents.push(content.clone());
        }

        let distinct: BTreeSet<&Option<String>> = versions.values().collect();
        if distinct.len() == 1 {
            let Some((owner, version)) = versions.iter().next().map(|(id, v)| (id.clone(), v.clone())) else {
                continue;
            };
            let Some(member) = members.iter().find(|m| m.id == owner) else {
                continue;
            };
            let at_fork = vcs.read_file(&member.fork_point, &path).await?;
            if at_fork == at_base {
                match version {
                    Some(content) => non_contested.write(path, content),
                    None => non_contested.delete(path),
                };
                continue;
            }
            // The integration line changed the file after the member forked
            match structural::resolve(at_fork.as_deref(), at_base.as_deref(), version.as_deref()) {
                Some(merged) => {
                    non_contested.write(path, merged);
                }
                None => contested.push(ContestedFile {
                    path,
                    base: at_base,
                    versions,
                }),
            }
            continue;
        }
        contested.push(ContestedFile {
            path,
            base: at_base,
            versions,
        });
    }

    let refs: Vec<&str> = base_contents.iter().map(String::as_str).collect();
    debug!(
        cluster = %cluster.id,
        contested = contested.len(),
        uncontested = non_contested.len(),
        "Resolution context assembled"
    );
    Ok(ResolutionContext {
        cluster_id: cluster.id.clone(),
        base: base.clone(),
        members,
        contested,
        non_contested,
        conventions: conventions(&refs),
        classification: cluster.classification.classification,
        severity: cluster.classification.severity,
        risk_flags: cluster.classification.risk_flags.clone(),
        base_signatures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::GroupClassification;
    use crate::testing::{change_sets, MemoryVcs};

    #[tokio::test]
    async fn test_contested_and_uncontested_files_are_split() {
        let vcs = MemoryVcs::new();
        let root = vcs.root(&[("src/shared.rs", "fn a() {}\n")]);
        vcs.branch_from("agent/a", &root);
        vcs.branch_from("agent/b", &root);
        vcs.commit_on(
            "agent/a",
            &[("src/shared.rs", Some("fn a() { 1 }\n")), ("src/only_a.rs", Some("pub fn only_a() {}\n"))],
            "feat: a",
        );
        vcs.commit_on("agent/b", &[("src/shared.rs", Some("fn a() { 2 }\n"))], "feat: b");

        let sets = change_sets(&vcs, &["agent/a", "agent/b"]).await;
        let ids = sets.iter().map(|cs| cs.id.clone()).collect();
        let cluster = Cluster::new(sets, GroupClassification::independent(ids, BTreeSet::new()), Vec::new());
        let context = assemble(&vcs, &cluster, &root).await.unwrap();

        assert_eq!(context.contested_paths(), ["src/shared.rs".to_string()].into_iter().collect());
        assert_eq!(context.contested[0].base.as_deref(), Some("fn a() {}\n"));
        assert!(context.non_contested.get("src/only_a.rs").is_some());
        let a = context.member(&ChangeSetId::new("agent/a")).unwrap();
        assert_eq!(a.summary.files_added, vec!["src/only_a.rs".to_string()]);
        assert_eq!(a.summary.commit_subjects, vec!["feat: a".to_string()]);
    }

    #[tokio::test]
    async fn test_identical_edits_are_not_contested() {
        let vcs = MemoryVcs::new();
        let root = vcs.root(&[("README.md", "hello\n")]);
        vcs.branch_from("agent/a", &root);
        vcs.branch_from("agent/b", &root);
        vcs.commit_on("agent/a", &[("README.md", Some("hello world\n"))], "a");
        vcs.commit_on("agent/b", &[("README.md", Some("hello world\n"))], "b");

        let sets = change_sets(&vcs, &["agent/a", "agent/b"]).await;
        let ids = sets.iter().map(|cs| cs.id.clone()).collect();
        let cluster = Cluster::new(sets, GroupClassification::independent(ids, BTreeSet::new()), Vec::new());
        let context = assemble(&vcs, &cluster, &root).await.unwrap();

        assert!(context.contested.is_empty());
        assert_eq!(
            context.non_contested.get("README.md").and_then(|e| e.content()),
            Some("hello world\n")
        );
    }

    #[test]
    fn test_conventions_detect_indentation() {
        let signals = conventions(&["fn a() {\n  x();\n  y();\n}\n"]);
        assert_eq!(signals.indent, IndentStyle::Spaces(2));
        assert!(signals.trailing_newline);
    }
}
