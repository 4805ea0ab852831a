use chrono::Utc;
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::budget::{BudgetController, Denial, RunGuard};
use crate::classify::manifest::manifest_kind;
use crate::classify::{structural, Classification};
use crate::cluster::Cluster;
use crate::config::PipelineConfig;
use crate::exec::{BuildExecutor, BuildReport, ExecError, LintReport, TestFilter, TestReport};
use crate::observability::pipeline_metrics;
use crate::oracle::{CandidateRequest, OracleError, ReasoningOracle};
use crate::retry::RetryPolicy;
use crate::store::operation_key;
use crate::vcs::{merge_all, Patch, Revision, VcsError, VersionControl};

use super::candidates::{diversity_hint, max_similarity, plan_strategies};
use super::context::{self, ResolutionContext};
use super::decision::{decide, recommend, Verdict};
use super::dependency::{resolve_manifest, ManifestResolution};
use super::harmonize::{canonical, signature_conflicts};
use super::intent::check_intents;
use super::test_synthesis::{cap_tests, interaction_points, merge_member_tests};
use super::validation::rank;
use super::{
    Candidate, Decision, Escalation, EscalationReason, PipelineError, PipelineStage, Recommendation, Resolution,
    ResolutionMemo, StageRecord, Strategy, ValidationScores,
};

/// Why a run stopped before the decision stage
pub(super) enum Halt {
    Escalate {
        reason: EscalationReason,
        ranked: Vec<Candidate>,
        recommended: Option<Recommendation>,
    },
    Fatal(PipelineError),
}

impl From<EscalationReason> for Halt {
    fn from(reason: EscalationReason) -> Self {
        Halt::Escalate {
            reason,
            ranked: Vec::new(),
            recommended: None,
        }
    }
}

impl From<PipelineError> for Halt {
    fn from(error: PipelineError) -> Self {
        Halt::Fatal(error)
    }
}

fn denial_reason(denial: Denial) -> EscalationReason {
    match denial {
        Denial::BudgetExceeded { resource } => EscalationReason::BudgetExceeded {
            resource: resource.to_string(),
        },
        Denial::CircuitOpen { .. } => EscalationReason::CircuitOpen,
        Denial::Cancelled => EscalationReason::Cancelled,
    }
}

fn input(stage: PipelineStage) -> impl Fn(VcsError) -> Halt {
    move |error| {
        Halt::Fatal(PipelineError::Input {
            stage,
            message: error.to_string(),
        })
    }
}

fn stage_failed(stage: PipelineStage, error: impl std::fmt::Display) -> Halt {
    Halt::from(EscalationReason::StageFailed {
        stage,
        detail: error.to_string(),
    })
}

/// Where a run starts
#[derive(Debug, Clone)]
pub enum EntryPoint {
    Start,
    /// Re-entry after the queue could not land a resolution; intents,
    /// adapters and tests from the earlier run are reused. A memo without
    /// intents (fast-path resolutions) goes through stages 2 to 5 first.
    CandidateGeneration { memo: ResolutionMemo },
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub decision: Decision,
    pub history: Vec<StageRecord>,
}

struct RunState<'a> {
    cluster: &'a Cluster,
    base: Revision,
    key: String,
    memo: ResolutionMemo,
    history: Vec<StageRecord>,
}

impl RunState<'_> {
    fn member_heads(&self) -> Vec<Revision> {
        self.cluster.members.iter().map(|m| m.head_revision.clone()).collect()
    }

    fn resolution(&self, candidate: Candidate, fast_path: bool) -> Resolution {
        Resolution {
            key: self.key.clone(),
            cluster_id: self.cluster.id.clone(),
            base: self.base.clone(),
            members: self.cluster.member_ids(),
            member_heads: self.member_heads(),
            candidate,
            fast_path,
            min_intent_confidence: self.memo.min_confidence(),
            memo: self.memo.clone(),
            decided_at: Utc::now(),
        }
    }

    fn escalation(
        &self,
        reason: EscalationReason,
        ranked: Vec<Candidate>,
        recommended: Option<Recommendation>,
    ) -> Escalation {
        let recommended = recommended.unwrap_or_else(|| recommend(&ranked));
        Escalation {
            key: self.key.clone(),
            cluster_id: self.cluster.id.clone(),
            base: self.base.clone(),
            members: self.cluster.member_ids(),
            member_heads: self.member_heads(),
            reason,
            ranked,
            recommended,
            min_intent_confidence: self.memo.min_confidence(),
            memo: self.memo.clone(),
            decided_at: Utc::now(),
        }
    }
}

enum FastPath {
    Delivered(Resolution),
    FallThrough(Option<ResolutionContext>),
}

/// Runs one cluster through the fast path or the full staged pipeline
pub struct ResolutionPipeline {
    pub(super) vcs: Arc<dyn VersionControl>,
    pub(super) executor: Arc<dyn BuildExecutor>,
    pub(super) oracle: Arc<dyn ReasoningOracle>,
    pub(super) budget: Arc<BudgetController>,
    pub(super) settings: PipelineConfig,
    fast_path_confidence: f64,
    retry: RetryPolicy,
}

impl ResolutionPipeline {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        executor: Arc<dyn BuildExecutor>,
        oracle: Arc<dyn ReasoningOracle>,
        budget: Arc<BudgetController>,
        settings: PipelineConfig,
        fast_path_confidence: f64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            vcs,
            executor,
            oracle,
            budget,
            settings,
            fast_path_confidence,
            retry,
        }
    }

    /// Stable key of a resolution attempt: the cluster and its member heads
    pub fn decision_key(cluster: &Cluster) -> String {
        operation_key(cluster.id.as_str(), cluster.members.iter().map(|m| &m.head_revision))
    }

    pub async fn run(
        &self,
        cluster: &Cluster,
        base: &Revision,
        entry: EntryPoint,
        guard: &RunGuard,
    ) -> Result<PipelineRun, PipelineError> {
        let mut run = RunState {
            cluster,
            base: base.clone(),
            key: Self::decision_key(cluster),
            memo: ResolutionMemo::default(),
            history: Vec::new(),
        };
        info!(
            cluster = %cluster.id,
            members = cluster.members.len(),
            classification = %cluster.classification.classification,
            entry = ?entry,
            "Pipeline run started"
        );

        let outcome = match entry {
            EntryPoint::Start => self.from_start(&mut run, guard).await,
            EntryPoint::CandidateGeneration { memo } if memo.intents.is_empty() => {
                debug!(cluster = %cluster.id, "No intents carried over, re-running stages 2 to 5");
                self.from_intents(&mut run, None, guard).await
            }
            EntryPoint::CandidateGeneration { memo } => {
                run.memo = memo;
                self.from_candidates(&mut run, None, guard).await
            }
        };

        let decision = match outcome {
            Ok(resolution) => {
                pipeline_metrics().record_auto_resolution();
                if resolution.fast_path {
                    pipeline_metrics().record_fast_path();
                }
                Decision::AutoResolve(resolution)
            }
            Err(Halt::Escalate {
                reason,
                ranked,
                recommended,
            }) => {
                pipeline_metrics().record_escalation(reason.code());
                Decision::Escalate(run.escalation(reason, ranked, recommended))
            }
            Err(Halt::Fatal(error)) => {
                warn!(cluster = %cluster.id, error = %error, "Pipeline run aborted");
                return Err(error);
            }
        };

        info!(cluster = %cluster.id, decision = %decision.label(), "Pipeline run finished");
        Ok(PipelineRun {
            decision,
            history: run.history,
        })
    }

    /// Gate, run and record one stage. Budget exhausted while the stage ran
    /// turns its outcome into an escalation.
    async fn stage<T>(
        &self,
        history: &mut Vec<StageRecord>,
        stage: PipelineStage,
        guard: &RunGuard,
        work: impl Future<Output = Result<T, Halt>>,
    ) -> Result<T, Halt> {
        self.gate(guard)?;
        let started_at = Utc::now();
        let timer = Instant::now();
        let result = work.await;

        let outcome = match &result {
            Ok(_) => "completed".to_string(),
            Err(Halt::Escalate { reason, .. }) => format!("escalate: {}", reason.code()),
            Err(Halt::Fatal(error)) => format!("error: {error}"),
        };
        let duration_ms = timer.elapsed().as_millis() as u64;
        debug!(%stage, duration_ms, outcome = %outcome, "Stage finished");
        history.push(StageRecord {
            stage,
            started_at,
            duration_ms,
            outcome,
        });

        let value = result?;
        if stage != PipelineStage::Decision {
            if let Some(denial) = self.budget.exhausted() {
                return Err(denial_reason(denial).into());
            }
        }
        Ok(value)
    }

    pub(super) fn gate(&self, guard: &RunGuard) -> Result<(), Halt> {
        self.budget
            .check_stage(guard)
            .map_err(|denial| Halt::from(denial_reason(denial)))
    }

    /// Oracle call under a timeout, retried while the failure is transient.
    /// Every attempt is charged to the budget.
    pub(super) async fn ask_oracle<T, F, Fut>(&self, stage: PipelineStage, operation: &str, mut call: F) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OracleError>>,
    {
        if let Some(denial) = self.budget.exhausted() {
            return Err(denial_reason(denial).into());
        }
        let timeout = Duration::from_secs(self.settings.oracle_timeout_seconds);
        let budget = &self.budget;
        self.retry
            .run(
                operation,
                || {
                    budget.record_oracle_call();
                    let pending = call();
                    async move {
                        match tokio::time::timeout(timeout, pending).await {
                            Ok(answer) => answer,
                            Err(_) => Err(OracleError::Timeout {
                                operation: operation.to_string(),
                                timeout_ms: timeout.as_millis() as u64,
                            }),
                        }
                    }
                },
                OracleError::is_transient,
            )
            .await
            .map_err(|error| stage_failed(stage, error))
    }

    fn retry_exec(error: &ExecError) -> bool {
        matches!(error, ExecError::Timeout { .. })
    }

    pub(super) async fn build(&self, stage: PipelineStage, revision: &Revision) -> Result<BuildReport, Halt> {
        let timeout = Duration::from_secs(self.settings.build_timeout_seconds);
        let executor = &self.executor;
        let report = self
            .retry
            .run("build", || executor.build(revision, timeout), Self::retry_exec)
            .await
            .map_err(|error| stage_failed(stage, error))?;
        self.budget.record_execution(report.duration_ms);
        Ok(report)
    }

    pub(super) async fn lint(&self, stage: PipelineStage, revision: &Revision) -> Result<LintReport, Halt> {
        let timeout = Duration::from_secs(self.settings.lint_timeout_seconds);
        let executor = &self.executor;
        let report = self
            .retry
            .run("lint", || executor.lint(revision, timeout), Self::retry_exec)
            .await
            .map_err(|error| stage_failed(stage, error))?;
        self.budget.record_execution(report.duration_ms);
        Ok(report)
    }

    pub(super) async fn test(
        &self,
        stage: PipelineStage,
        revision: &Revision,
        filter: &TestFilter,
        timeout: Duration,
    ) -> Result<TestReport, Halt> {
        let executor = &self.executor;
        let report = self
            .retry
            .run("test", || executor.test(revision, filter, timeout), Self::retry_exec)
            .await
            .map_err(|error| stage_failed(stage, error))?;
        self.budget.record_execution(report.duration_ms);
        Ok(report)
    }

    async fn from_start(&self, run: &mut RunState<'_>, guard: &RunGuard) -> Result<Resolution, Halt> {
        let mut history = std::mem::take(&mut run.history);
        let fast = self
            .stage(&mut history, PipelineStage::FastPath, guard, self.fast_path(run))
            .await;
        run.history = history;
        match fast? {
            FastPath::Delivered(resolution) => Ok(resolution),
            FastPath::FallThrough(context) => self.from_intents(run, context, guard).await,
        }
    }

    async fn assemble_context(&self, run: &RunState<'_>) -> Result<ResolutionContext, Halt> {
        context::assemble(self.vcs.as_ref(), run.cluster, &run.base)
            .await
            .map_err(input(PipelineStage::ContextAssembly))
    }

    async fn fast_path(&self, run: &RunState<'_>) -> Result<FastPath, Halt> {
        let stage = PipelineStage::FastPath;
        let group = &run.cluster.classification;
        match group.classification {
            Classification::None => {
                let heads: Vec<Revision> = run.cluster.members.iter().map(|m| m.head_revision.clone()).collect();
                let outcome = merge_all(self.vcs.as_ref(), &run.base, &heads)
                    .await
                    .map_err(input(stage))?;
                let Some(merged) = outcome.merged.filter(|_| outcome.conflicts.is_empty()) else {
                    warn!(cluster = %run.cluster.id, conflicts = ?outcome.conflicts, "Independent cluster did not merge cleanly");
                    return Ok(FastPath::FallThrough(None));
                };
                let patch = self.vcs.diff(&run.base, &merged).await.map_err(input(stage))?;
                let summary = format!("clean merge of {} change sets", heads.len());
                Ok(FastPath::Delivered(run.resolution(delivered(patch, merged, summary), true)))
            }
            Classification::Textual if group.textual_confidence >= self.fast_path_confidence && !group.is_high_risk() => {
                let context = self.assemble_context(run).await?;
                let mut patch = context.non_contested.clone();
                for file in &context.contested {
                    let versions: Vec<Option<&str>> = file.versions.values().map(|v| v.as_deref()).collect();
                    match structural::resolve_many(file.base.as_deref(), &versions) {
                        Some(content) => {
                            patch.write(file.path.clone(), content);
                        }
                        None => return Ok(FastPath::FallThrough(Some(context))),
                    }
                }
                self.try_fast_candidate(run, context, patch, "structural merge").await
            }
            Classification::Dependency if !group.is_high_risk() => {
                let context = self.assemble_context(run).await?;
                let mut patch = context.non_contested.clone();
                for file in &context.contested {
                    let resolved = match manifest_kind(&file.path) {
                        Some(kind) => match resolve_manifest(kind, file).map_err(|error| {
                            Halt::Fatal(PipelineError::Input {
                                stage,
                                message: format!("{}: {error}", file.path),
                            })
                        })? {
                            ManifestResolution::Resolved(content) => Some(content),
                            ManifestResolution::Unmerged => None,
                            ManifestResolution::Incompatible { package, requirements } => {
                                return Err(EscalationReason::IncompatibleDependency { package, requirements }.into());
                            }
                        },
                        None => {
                            let versions: Vec<Option<&str>> = file.versions.values().map(|v| v.as_deref()).collect();
                            structural::resolve_many(file.base.as_deref(), &versions)
                        }
                    };
                    match resolved {
                        Some(content) => {
                            patch.write(file.path.clone(), content);
                        }
                        None => return Ok(FastPath::FallThrough(Some(context))),
                    }
                }
                self.try_fast_candidate(run, context, patch, "manifest resolution").await
            }
            _ => Ok(FastPath::FallThrough(None)),
        }
    }

    /// Commit a mechanically merged patch and keep it only if it builds
    async fn try_fast_candidate(
        &self,
        run: &RunState<'_>,
        context: ResolutionContext,
        patch: Patch,
        summary: &str,
    ) -> Result<FastPath, Halt> {
        let stage = PipelineStage::FastPath;
        let message = format!("{summary} for {}", run.cluster.id);
        let revision = self
            .vcs
            .commit_patch(&run.base, &patch, &message)
            .await
            .map_err(input(stage))?;
        let report = self.build(stage, &revision).await?;
        if !report.passed {
            debug!(cluster = %run.cluster.id, "Fast-path merge does not build, running the full pipeline");
            return Ok(FastPath::FallThrough(Some(context)));
        }
        let mut candidate = delivered(patch, revision, summary.to_string());
        candidate.scores.build_passed = true;
        Ok(FastPath::Delivered(run.resolution(candidate, true)))
    }

    async fn from_intents(
        &self,
        run: &mut RunState<'_>,
        context: Option<ResolutionContext>,
        guard: &RunGuard,
    ) -> Result<Resolution, Halt> {
        let mut history = std::mem::take(&mut run.history);
        let result = self.prepare(run, &mut history, context, guard).await;
        run.history = history;
        let (context, memo) = result?;
        run.memo = memo;
        self.from_candidates(run, Some(context), guard).await
    }

    /// Stages 2 to 5: context, intents, harmonized interfaces and tests
    async fn prepare(
        &self,
        run: &RunState<'_>,
        history: &mut Vec<StageRecord>,
        context: Option<ResolutionContext>,
        guard: &RunGuard,
    ) -> Result<(ResolutionContext, ResolutionMemo), Halt> {
        let context = match context {
            Some(context) => context,
            None => {
                self.stage(history, PipelineStage::ContextAssembly, guard, self.assemble_context(run))
                    .await?
            }
        };
        let mut memo = ResolutionMemo::default();

        memo.intents = self
            .stage(history, PipelineStage::IntentExtraction, guard, self.extract_intents(&context))
            .await?;

        memo.adapter = self
            .stage(history, PipelineStage::InterfaceHarmonization, guard, self.harmonize(&context))
            .await?;

        let (merged_tests, synthesized) = self
            .stage(history, PipelineStage::TestSynthesis, guard, self.synthesize_tests(&context))
            .await?;
        memo.merged_tests = merged_tests;
        memo.synthesized_tests = synthesized;
        Ok((context, memo))
    }

    async fn extract_intents(&self, context: &ResolutionContext) -> Result<Vec<crate::oracle::IntentSummary>, Halt> {
        let stage = PipelineStage::IntentExtraction;
        let intents = try_join_all(context.members.iter().map(|member| {
            self.ask_oracle(stage, "extract_intent", || self.oracle.extract_intent(context, &member.id))
        }))
        .await?;
        let intents: Vec<_> = intents.into_iter().map(|intent| intent.clamped()).collect();
        check_intents(&intents, self.settings.intent_confidence_floor)?;
        Ok(intents)
    }

    async fn harmonize(&self, context: &ResolutionContext) -> Result<Patch, Halt> {
        let stage = PipelineStage::InterfaceHarmonization;
        let conflicts = signature_conflicts(context);
        let mut adapter = Patch::new();
        if conflicts.is_empty() {
            return Ok(adapter);
        }

        for conflict in &conflicts {
            let request = canonical(context, conflict);
            debug!(
                symbol = %request.symbol,
                canonical = %request.canonical_signature,
                displaced = request.displaced.len(),
                "Harmonizing interface"
            );
            let patch = self
                .ask_oracle(stage, "propose_adapter", || self.oracle.propose_adapter(context, &request))
                .await?;
            adapter.overlay(&patch);
        }

        let contested = context.contested_paths();
        let settled_here: Vec<&str> = conflicts
            .iter()
            .filter(|c| c.paths().is_disjoint(&contested))
            .map(|c| c.symbol.as_str())
            .collect();
        if settled_here.is_empty() {
            return Ok(adapter);
        }

        let tree = context.non_contested.overlaid(&adapter);
        let message = format!("interface adapter for {}", context.cluster_id);
        let revision = self
            .vcs
            .commit_patch(&context.base, &tree, &message)
            .await
            .map_err(input(stage))?;
        let report = self.build(stage, &revision).await?;
        if !report.passed {
            return Err(EscalationReason::CannotHarmonize {
                symbol: settled_here.join(", "),
                detail: report.output.lines().next().unwrap_or("build failed").to_string(),
            }
            .into());
        }
        Ok(adapter)
    }

    async fn synthesize_tests(
        &self,
        context: &ResolutionContext,
    ) -> Result<(Patch, Vec<crate::oracle::SynthesizedTest>), Halt> {
        let merged = merge_member_tests(context);
        let points = interaction_points(context, &signature_conflicts(context));
        let limit = self.settings.max_synthesized_tests;
        if points.is_empty() || limit == 0 {
            return Ok((merged, Vec::new()));
        }
        let proposed = self
            .ask_oracle(PipelineStage::TestSynthesis, "synthesize_tests", || {
                self.oracle.synthesize_tests(context, &points, limit)
            })
            .await?;
        Ok((merged, cap_tests(proposed, limit, context)))
    }

    /// Stages 6 to 8. Re-entry from the queue starts here with a fresh context.
    async fn from_candidates(
        &self,
        run: &mut RunState<'_>,
        context: Option<ResolutionContext>,
        guard: &RunGuard,
    ) -> Result<Resolution, Halt> {
        let mut history = std::mem::take(&mut run.history);
        let result = self.choose(run, &mut history, context, guard).await;
        run.history = history;
        result
    }

    async fn choose(
        &self,
        run: &RunState<'_>,
        history: &mut Vec<StageRecord>,
        context: Option<ResolutionContext>,
        guard: &RunGuard,
    ) -> Result<Resolution, Halt> {
        let context = match context {
            Some(context) => context,
            None => {
                self.stage(history, PipelineStage::ContextAssembly, guard, self.assemble_context(run))
                    .await?
            }
        };
        let memo = &run.memo;

        let candidates = self
            .stage(
                history,
                PipelineStage::CandidateGeneration,
                guard,
                self.generate(&context, memo, guard),
            )
            .await?;

        let synthesized = memo.synthesized_tests.clone();
        let validation = async {
            let mut ranked = self.validate(&context, candidates, &synthesized, guard).await?;
            let planned_minimal = ranked.iter().any(|c| c.strategy == Strategy::MinimalMerge);
            if !planned_minimal && !ranked.iter().any(Candidate::passed) {
                info!(cluster = %context.cluster_id, "No candidate validated, trying a minimal merge");
                let fallback = self.minimal_merge(&context, memo).await?;
                let fallback = self.validate(&context, vec![fallback], &synthesized, guard).await?;
                ranked.extend(fallback);
                ranked = rank(ranked);
            }
            Ok::<_, Halt>(ranked)
        };
        let ranked = self
            .stage(history, PipelineStage::Validation, guard, validation)
            .await?;

        let verdict = self
            .stage(history, PipelineStage::Decision, guard, async {
                Ok(decide(
                    &ranked,
                    &context.high_risk_flags(),
                    &memo.intents,
                    &self.settings,
                ))
            })
            .await?;

        match verdict {
            Verdict::Accept(index) => Ok(run.resolution(ranked[index].clone(), false)),
            Verdict::Escalate { reason, recommended } => Err(Halt::Escalate {
                reason,
                ranked,
                recommended: Some(recommended),
            }),
        }
    }

    async fn generate(
        &self,
        context: &ResolutionContext,
        memo: &ResolutionMemo,
        guard: &RunGuard,
    ) -> Result<Vec<Candidate>, Halt> {
        let stage = PipelineStage::CandidateGeneration;
        let scaffold = context.non_contested.overlaid(&memo.scaffold());
        let contested = context.contested_paths();
        let contested_list: Vec<String> = contested.iter().cloned().collect();
        let strategies = plan_strategies(
            &context.member_ids(),
            context.severity,
            self.settings.min_candidates,
            self.settings.max_candidates,
        );

        let mut drafts: Vec<(Strategy, Patch, String)> = Vec::new();
        for strategy in strategies {
            self.gate(guard)?;
            if strategy == Strategy::MinimalMerge {
                drafts.push((strategy, Patch::new(), "uncontested changes only".to_string()));
                continue;
            }
            let mut hint = None;
            let mut attempt = 0;
            loop {
                let request = CandidateRequest {
                    strategy: strategy.clone(),
                    intents: memo.intents.clone(),
                    scaffold: scaffold.clone(),
                    contested: contested_list.clone(),
                    diversity_hint: hint.clone(),
                };
                let draft = self
                    .ask_oracle(stage, "synthesize_candidate", || {
                        self.oracle.synthesize_candidate(context, &request)
                    })
                    .await?;
                let similarity = max_similarity(
                    &draft.patch,
                    drafts
                        .iter()
                        .filter(|(planned, ..)| *planned != Strategy::MinimalMerge)
                        .map(|(_, patch, _)| patch),
                );
                if similarity <= self.settings.max_similarity {
                    drafts.push((strategy.clone(), draft.patch, draft.summary));
                    break;
                }
                if contested.is_empty() || attempt >= self.settings.max_regenerations {
                    debug!(%strategy, similarity, "Dropping duplicate candidate");
                    break;
                }
                hint = Some(diversity_hint(&strategy, attempt));
                attempt += 1;
            }
        }

        if !contested.is_empty() && drafts.len() < self.settings.min_candidates {
            warn!(
                cluster = %context.cluster_id,
                produced = drafts.len(),
                required = self.settings.min_candidates,
                "Too few distinct candidates"
            );
            return Err(EscalationReason::TooFewCandidates {
                produced: drafts.len(),
                required: self.settings.min_candidates,
            }
            .into());
        }

        let mut candidates = Vec::with_capacity(drafts.len());
        for (strategy, draft, summary) in drafts {
            let patch = scaffold.overlaid(&draft);
            let deferred: BTreeSet<String> = contested.iter().filter(|p| draft.get(p).is_none()).cloned().collect();
            let message = format!("{} candidate for {}", strategy.label(), context.cluster_id);
            let revision = self
                .vcs
                .commit_patch(&context.base, &patch, &message)
                .await
                .map_err(input(stage))?;
            candidates.push(Candidate {
                strategy,
                patch,
                revision,
                summary,
                deferred_files: deferred,
                scores: ValidationScores::default(),
                total_score: 0.0,
            });
        }
        info!(cluster = %context.cluster_id, candidates = candidates.len(), "Candidates generated");
        Ok(candidates)
    }

    /// Uncontested changes only; every contested file is deferred
    async fn minimal_merge(&self, context: &ResolutionContext, memo: &ResolutionMemo) -> Result<Candidate, Halt> {
        let patch = context.non_contested.overlaid(&memo.scaffold());
        let message = format!("minimal merge for {}", context.cluster_id);
        let revision = self
            .vcs
            .commit_patch(&context.base, &patch, &message)
            .await
            .map_err(input(PipelineStage::Validation))?;
        Ok(Candidate {
            strategy: Strategy::MinimalMerge,
            patch,
            revision,
            summary: "uncontested changes only".to_string(),
            deferred_files: context.contested_paths(),
            scores: ValidationScores::default(),
            total_score: 0.0,
        })
    }
}

fn delivered(patch: Patch, revision: Revision, summary: String) -> Candidate {
    Candidate {
        strategy: Strategy::CleanMerge,
        patch,
        revision,
        summary,
        deferred_files: BTreeSet::new(),
        scores: ValidationScores::default(),
        total_score: 1.0,
    }
}
