use std::collections::{BTreeMap, BTreeSet};

use crate::classify::symbols;
use crate::oracle::AdapterRequest;
use crate::registry::ChangeSetId;

use super::ResolutionContext;

/// One exported symbol that members define incompatibly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureConflict {
    pub symbol: String,
    /// Member to (path, normalized signature)
    pub definitions: BTreeMap<ChangeSetId, (String, String)>,
}

impl SignatureConflict {
    pub fn paths(&self) -> BTreeSet<String> {
        self.definitions.values().map(|(path, _)| path.clone()).collect()
    }
}

/// Symbols at least two members add or change with differing signatures,
/// or define in different files
pub fn signature_conflicts(context: &ResolutionContext) -> Vec<SignatureConflict> {
    let mut by_symbol: BTreeMap<String, BTreeMap<ChangeSetId, (String, String)>> = BTreeMap::new();
    for member in &context.members {
        for (path, edit) in &member.patch.files {
            let Some(content) = edit.content() else {
                continue;
            };
            for (symbol, signature) in symbols::extract_signatures(path, content) {
                if member.summary.changed_symbols.contains(&symbol) {
                    by_symbol
                        .entry(symbol)
                        .or_default()
                        .entry(member.id.clone())
                        .or_insert((path.clone(), signature));
                }
            }
        }
    }

    by_symbol
        .into_iter()
        .filter(|(_, definitions)| {
            let signatures: BTreeSet<&String> = definitions.values().map(|(_, sig)| sig).collect();
            let paths: BTreeSet<&String> = definitions.values().map(|(path, _)| path).collect();
            definitions.len() > 1 && (signatures.len() > 1 || paths.len() > 1)
        })
        .map(|(symbol, definitions)| SignatureConflict { symbol, definitions })
        .collect()
}

fn call_sites(context: &ResolutionContext, member: &ChangeSetId, symbol: &str) -> usize {
    let Some(member) = context.member(member) else {
        return 0;
    };
    member
        .patch
        .files
        .values()
        .filter_map(|edit| edit.content())
        .map(|content| symbols::count_call_sites(symbol, content))
        .sum()
}

/// Pick the canonical definition: the one already upstream, otherwise the one
/// with the most call sites. Ties go to the lowest member id.
pub fn canonical(context: &ResolutionContext, conflict: &SignatureConflict) -> AdapterRequest {
    let upstream = context.base_signatures.get(&conflict.symbol);
    let owner = conflict
        .definitions
        .iter()
        .find(|(_, (_, signature))| Some(signature) == upstream)
        .map(|(member, _)| member.clone())
        .or_else(|| {
            conflict
                .definitions
                .keys()
                .map(|member| (call_sites(context, member, &conflict.symbol), member))
                .max_by(|(a_calls, a_id), (b_calls, b_id)| a_calls.cmp(b_calls).then_with(|| b_id.cmp(a_id)))
                .map(|(_, member)| member.clone())
        });

    let canonical_signature = owner
        .as_ref()
        .and_then(|member| conflict.definitions.get(member))
        .map(|(_, signature)| signature.clone())
        .unwrap_or_default();
    let canonical_path = owner
        .as_ref()
        .and_then(|member| conflict.definitions.get(member))
        .map(|(path, _)| path.clone());

    let displaced = conflict
        .definitions
        .iter()
        .filter(|(member, (path, signature))| {
            Some(*member) != owner.as_ref()
                && (signature != &canonical_signature || Some(path) != canonical_path.as_ref())
        })
        .map(|(member, (_, signature))| (member.clone(), signature.clone()))
        .collect();

    AdapterRequest {
        symbol: conflict.symbol.clone(),
        canonical_signature,
        canonical_owner: owner,
        displaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::GroupClassification;
    use crate::cluster::Cluster;
    use crate::pipeline::context;
    use crate::testing::{change_sets, MemoryVcs};

    async fn context_for(vcs: &MemoryVcs) -> ResolutionContext {
        let sets = change_sets(vcs, &["agent/a", "agent/b"]).await;
        let ids = sets.iter().map(|cs| cs.id.clone()).collect();
        let cluster = Cluster::new(sets, GroupClassification::independent(ids, BTreeSet::new()), Vec::new());
        let base = vcs.head("main");
        context::assemble(vcs, &cluster, &base).await.unwrap()
    }

    #[tokio::test]
    async fn test_most_called_signature_wins() {
        let vcs = MemoryVcs::new();
        let root = vcs.root(&[("src/lib.rs", "mod calc;\n")]);
        vcs.branch_from("agent/a", &root);
        vcs.branch_from("agent/b", &root);
        vcs.commit_on(
            "agent/a",
            &[("src/calc.rs", Some("pub fn total(a: u32) -> u32 { a }\n"))],
            "a",
        );
        vcs.commit_on(
            "agent/b",
            &[
                ("src/calc.rs", Some("pub fn total(a: u32, b: u32) -> u32 { a + b }\n")),
                ("src/use.rs", Some("fn x() { total(1, 2); total(3, 4); }\n")),
            ],
            "b",
        );

        let context = context_for(&vcs).await;
        let conflicts = signature_conflicts(&context);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].symbol, "total");

        let request = canonical(&context, &conflicts[0]);
        assert_eq!(request.canonical_owner, Some(ChangeSetId::new("agent/b")));
        assert_eq!(request.canonical_signature, "pub fn total(a: u32, b: u32) -> u32");
        assert_eq!(request.displaced.len(), 1);
        assert_eq!(request.displaced[0].0, ChangeSetId::new("agent/a"));
    }

    #[tokio::test]
    async fn test_duplicate_definitions_in_different_files_conflict() {
        let vcs = MemoryVcs::new();
        let root = vcs.root(&[("src/lib.rs", "\n")]);
        vcs.branch_from("agent/a", &root);
        vcs.branch_from("agent/b", &root);
        vcs.commit_on("agent/a", &[("src/one.rs", Some("pub fn helper() {}\n"))], "a");
        vcs.commit_on("agent/b", &[("src/two.rs", Some("pub fn helper() {}\n"))], "b");

        let context = context_for(&vcs).await;
        let conflicts = signature_conflicts(&context);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            conflicts[0].paths(),
            ["src/one.rs".to_string(), "src/two.rs".to_string()].into_iter().collect()
        );
        let request = canonical(&context, &conflicts[0]);
        assert_eq!(request.canonical_owner, Some(ChangeSetId::new("agent/a")));
        assert_eq!(request.displaced, vec![(ChangeSetId::new("agent/b"), "pub fn helper()".to_string())]);
    }

    #[tokio::test]
    async fn test_identical_changes_in_one_file_do_not_conflict() {
        let vcs = MemoryVcs::new();
        let root = vcs.root(&[("src/lib.rs", "pub fn a() {}\n")]);
        vcs.branch_from("agent/a", &root);
        vcs.branch_from("agent/b", &root);
        vcs.commit_on("agent/a", &[("src/lib.rs", Some("pub fn a(x: u8) {}\n"))], "a");
        vcs.commit_on("agent/b", &[("src/lib.rs", Some("pub fn a(x: u8) {}\n// note\n"))], "b");

        let context = context_for(&vcs).await;
        assert!(signature_conflicts(&context).is_empty());
    }
}
