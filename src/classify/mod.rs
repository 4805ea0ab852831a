//! Conflict classification
//!
//! Decides whether two complete change sets are independent or conflict
//! textually, semantically or at the dependency manifest level. A clean text
//! merge is always followed by a build and the targeted tests on the merged
//! tree. Results are cached by head revisions, so classifying the same pair
//! twice gives the same answer without touching the executor again.

pub mod manifest;
pub mod severity;
pub mod structural;
pub mod symbols;
mod types;

pub use severity::{RiskTagger, Severity};
pub use types::{
    Classification, ConflictEdge, ConflictKind, Evidence, GroupClassification, Overlap, PairClassification,
};

use futures::stream::{self, StreamExt, TryStreamExt};
use moka::future::Cache;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ClassifierConfig;
use crate::exec::{targeted_filter, BuildExecutor, ExecError, TestFilter};
use crate::observability::pipeline_metrics;
use crate::registry::{ChangeSet, ChangeSetId, RiskFlag};
use crate::retry::RetryPolicy;
use crate::store::content_key;
use crate::vcs::{Revision, VcsError, VersionControl};

use manifest::ManifestError;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classification of {a} and {b} incomplete: {reason}")]
    Incomplete {
        a: ChangeSetId,
        b: ChangeSetId,
        reason: String,
    },

    #[error("malformed manifest {path}: {source}")]
    MalformedManifest {
        path: String,
        #[source]
        source: ManifestError,
    },
}

pub struct ConflictClassifier {
    vcs: Arc<dyn VersionControl>,
    executor: Arc<dyn BuildExecutor>,
    settings: ClassifierConfig,
    retry: RetryPolicy,
    cache: Cache<String, PairClassification>,
}

fn overlap(a: &ChangeSet, b: &ChangeSet) -> Overlap {
    Overlap {
        files: a.files_touched.intersection(&b.files_touched).cloned().collect(),
        symbols: a.exported_symbols.intersection(&b.exported_symbols).cloned().collect(),
        packages: a.manifest_packages.intersection(&b.manifest_packages).cloned().collect(),
    }
}

fn first_lines(output: &str, limit: usize) -> String {
    output.lines().take(limit).collect::<Vec<_>>().join("\n")
}

impl ConflictClassifier {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        executor: Arc<dyn BuildExecutor>,
        settings: ClassifierConfig,
        retry: RetryPolicy,
    ) -> Self {
        let cache = Cache::new(settings.cache_capacity);
        Self {
            vcs,
            executor,
            settings,
            retry,
            cache,
        }
    }

    /// Classify one pair. The pair is ordered by id so (a, b) and (b, a) share a result.
    pub async fn classify_pair(&self, a: &ChangeSet, b: &ChangeSet) -> Result<PairClassification, ClassifyError> {
        let (a, b) = if a.id <= b.id { (a, b) } else { (b, a) };
        let key = content_key(&[
            a.id.as_str(),
            a.head_revision.as_str(),
            b.id.as_str(),
            b.head_revision.as_str(),
        ]);

        if let Some(hit) = self.cache.get(&key).await {
            pipeline_metrics().record_cache_hit();
            return Ok(hit);
        }
        pipeline_metrics().record_cache_miss();

        let result = self.compute(a, b).await?;
        debug!(
            a = %a.id,
            b = %b.id,
            classification = %result.classification,
            edges = result.edges.len(),
            "Classified pair"
        );
        self.cache.insert(key, result.clone()).await;
        Ok(result)
    }

    /// Classify every pair of `members` with bounded concurrency, ordered by pair ids
    pub async fn classify_group(&self, members: &[ChangeSet]) -> Result<Vec<PairClassification>, ClassifyError> {
        let mut pairs = Vec::new();
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                pairs.push((a, b));
            }
        }

        let mut results: Vec<PairClassification> = stream::iter(pairs)
            .map(|(a, b)| self.classify_pair(a, b))
            .buffer_unordered(self.settings.pair_concurrency.max(1))
            .try_collect()
            .await?;
        results.sort_by(|x, y| (&x.a, &x.b).cmp(&(&y.a, &y.b)));
        Ok(results)
    }

    /// Aggregate classification of a group from its pair results
    pub fn summarize(members: &[ChangeSet], pairs: &[PairClassification]) -> GroupClassification {
        let flags: BTreeMap<ChangeSetId, BTreeSet<RiskFlag>> =
            members.iter().map(|cs| (cs.id.clone(), cs.risk_flags())).collect();
        let ids = members.iter().map(|cs| cs.id.clone()).collect();
        GroupClassification::from_pairs(ids, pairs, &flags)
    }

    async fn compute(&self, a: &ChangeSet, b: &ChangeSet) -> Result<PairClassification, ClassifyError> {
        let incomplete = |reason: String| ClassifyError::Incomplete {
            a: a.id.clone(),
            b: b.id.clone(),
            reason,
        };
        let vcs_failure = |e: VcsError| incomplete(e.to_string());

        let overlap = overlap(a, b);
        let risk_flags: BTreeSet<RiskFlag> = a.risk_flags().union(&b.risk_flags()).copied().collect();
        let mut result = PairClassification {
            a: a.id.clone(),
            b: b.id.clone(),
            classification: Classification::None,
            edges: Vec::new(),
            overlap,
            textual_confidence: 1.0,
            semantic_failure: false,
            risk_flags,
            severity: Severity::Low,
        };
        if result.overlap.is_empty() {
            result.severity = severity::assess(&result.risk_flags, 2, false);
            return Ok(result);
        }

        let base = self
            .vcs
            .merge_base(&a.head_revision, &b.head_revision)
            .await
            .map_err(vcs_failure)?;

        // Manifests both sides touched: same package, different requirement
        let mut dependency_files = BTreeSet::new();
        for path in result.overlap.files.iter().filter(|p| manifest::is_manifest(p)) {
            let Some(kind) = manifest::manifest_kind(path) else { continue };
            let base_content = self.vcs.read_file(&base, path).await.map_err(vcs_failure)?;
            let ours = self.vcs.read_file(&a.head_revision, path).await.map_err(vcs_failure)?;
            let theirs = self.vcs.read_file(&b.head_revision, path).await.map_err(vcs_failure)?;
            let conflicts = manifest::conflicts(kind, base_content.as_deref(), ours.as_deref(), theirs.as_deref())
                .map_err(|source| ClassifyError::MalformedManifest {
                    path: path.clone(),
                    source,
                })?;
            if !conflicts.is_empty() {
                dependency_files.insert(path.clone());
            }
            for conflict in conflicts {
                result.edges.push(ConflictEdge {
                    a: a.id.clone(),
                    b: b.id.clone(),
                    kind: ConflictKind::Dependency,
                    evidence: Evidence::Package {
                        key: conflict.key,
                        ours: conflict.ours,
                        theirs: conflict.theirs,
                    },
                });
            }
        }

        let merge = self
            .vcs
            .merge_three(&base, &a.head_revision, &b.head_revision)
            .await
            .map_err(vcs_failure)?;

        match merge.merged {
            Some(merged) if merge.conflicts.is_empty() => {
                self.semantic_check(a, b, &merged, &mut result).await.map_err(|e| incomplete(e.to_string()))?;
            }
            _ => {
                let textual: Vec<&String> = merge.conflicts.iter().filter(|p| !dependency_files.contains(*p)).collect();
                let mut resolvable = 0usize;
                for path in &textual {
                    let base_content = self.vcs.read_file(&base, path).await.map_err(vcs_failure)?;
                    let ours = self.vcs.read_file(&a.head_revision, path).await.map_err(vcs_failure)?;
                    let theirs = self.vcs.read_file(&b.head_revision, path).await.map_err(vcs_failure)?;
                    if structural::resolve(base_content.as_deref(), ours.as_deref(), theirs.as_deref()).is_some() {
                        resolvable += 1;
                    }
                    result.edges.push(ConflictEdge {
                        a: a.id.clone(),
                        b: b.id.clone(),
                        kind: ConflictKind::Textual,
                        evidence: Evidence::File { path: (*path).clone() },
                    });
                }
                if !textual.is_empty() {
                    result.textual_confidence = resolvable as f64 / textual.len() as f64;
                }
            }
        }

        result.classification = result.edges.iter().fold(Classification::None, |acc, edge| {
            acc.dominant(match edge.kind {
                ConflictKind::Textual => Classification::Textual,
                ConflictKind::Semantic => Classification::Semantic,
                ConflictKind::Dependency => Classification::Dependency,
            })
        });
        result.severity = severity::assess(&result.risk_flags, 2, result.semantic_failure);
        if result.conflicts() {
            info!(
                a = %a.id,
                b = %b.id,
                classification = %result.classification,
                severity = ?result.severity,
                "Conflict detected"
            );
        }
        Ok(result)
    }

    /// Build and run targeted tests on a cleanly merged tree
    async fn semantic_check(
        &self,
        a: &ChangeSet,
        b: &ChangeSet,
        merged: &Revision,
        result: &mut PairClassification,
    ) -> Result<(), ExecError> {
        let build_timeout = Duration::from_secs(self.settings.semantic_build_timeout_seconds);
        let build = self
            .retry
            .run(
                "classify.build",
                || self.executor.build(merged, build_timeout),
                |e: &ExecError| matches!(e, ExecError::Timeout { .. }),
            )
            .await?;
        if !build.passed {
            result.semantic_failure = true;
            result.edges.push(ConflictEdge {
                a: a.id.clone(),
                b: b.id.clone(),
                kind: ConflictKind::Semantic,
                evidence: Evidence::BuildFailure {
                    summary: first_lines(&build.output, 5),
                },
            });
            return Ok(());
        }

        let names = targeted_filter(a.files_touched.iter().chain(b.files_touched.iter()));
        if names.is_empty() {
            return Ok(());
        }
        let filter = TestFilter::Named(names);
        let test_timeout = Duration::from_secs(self.settings.semantic_test_timeout_seconds);
        let report = self
            .retry
            .run(
                "classify.test",
                || self.executor.test(merged, &filter, test_timeout),
                |e: &ExecError| matches!(e, ExecError::Timeout { .. }),
            )
            .await?;
        if !report.is_green() {
            result.semantic_failure = true;
            result.edges.push(ConflictEdge {
                a: a.id.clone(),
                b: b.id.clone(),
                kind: ConflictKind::Semantic,
                evidence: Evidence::TestFailure { tests: report.failed },
            });
        }
        Ok(())
    }
}
