//! Resolution cycles
//!
//! One cycle refreshes the registry, clusters the eligible change sets, runs
//! the clusters wave by wave and hands every decision to the merge queue or a
//! human. Waves are strictly ordered: a wave starts on the integration head
//! its predecessor left behind.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use crate::budget::BudgetController;
use crate::checkpoint::{
    CheckpointError, CheckpointManager, CheckpointReason, Delivery, RollbackRequest, RollbackTarget, SelectiveRevert,
};
use crate::classify::severity::RiskTagger;
use crate::classify::ConflictClassifier;
use crate::cluster::{Cluster, ClusterBuilder, ClusterError, ClusterId, ClusterPlan};
use crate::config::{ConfigError, StewardConfig};
use crate::escalation::{EscalationRecord, EscalationSink, HumanVerdict};
use crate::exec::{BuildExecutor, ExecError, TestFilter};
use crate::observability::pipeline_metrics;
use crate::oracle::ReasoningOracle;
use crate::pipeline::{
    Decision, EntryPoint, Escalation, EscalationReason, PipelineError, Recommendation, Resolution, ResolutionPipeline,
};
use crate::queue::{DrainReport, MergeQueue, QueueEntry, QueueError, QueuePayload, QueueProcessor};
use crate::registry::{
    derive_facts, ChangeSet, ChangeSetHint, ChangeSetId, ChangeSetRegistry, ChangeSetSource, ChangeSetStatus,
    CompletionDetector, DeriveError, HeadIndex, RefreshReport, SourceError,
};
use crate::retry::RetryPolicy;
use crate::store::{operation_key, RecordKind, StateStore, StoreError};
use crate::telemetry::{create_cycle_span, create_resolution_span, generate_correlation_id};
use crate::vcs::{Revision, VcsError, VersionControl};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("change set discovery failed: {0}")]
    Source(#[from] SourceError),

    #[error("cannot derive change set facts: {0}")]
    Derive(#[from] DeriveError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("version control error: {0}")]
    Vcs(#[from] VcsError),

    #[error("executor error: {0}")]
    Exec(#[from] ExecError),

    #[error("revert of {0} produced no cluster")]
    EmptyRevert(ChangeSetId),
}

/// External systems a coordinator drives
pub struct Collaborators {
    pub vcs: Arc<dyn VersionControl>,
    pub executor: Arc<dyn BuildExecutor>,
    pub oracle: Arc<dyn ReasoningOracle>,
    pub source: Arc<dyn ChangeSetSource>,
    pub sink: Arc<dyn EscalationSink>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub correlation_id: String,
    pub refresh: RefreshReport,
    pub clusters: usize,
    pub waves: usize,
    pub auto_resolved: Vec<ClusterId>,
    pub escalated: Vec<(ClusterId, String)>,
    /// Clusters still waiting on an earlier escalation with the same inputs
    pub awaiting_human: Vec<ClusterId>,
    /// Clusters the budget or circuit breaker kept from starting
    pub deferred: Vec<(ClusterId, String)>,
    pub aborted: Vec<(ClusterId, String)>,
    pub merged: Vec<String>,
    pub requeued: Vec<ClusterId>,
    pub failed: Vec<String>,
    pub queue_busy: bool,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.clusters == 0 && self.merged.is_empty()
    }
}

/// Result of reverting a single change set
#[derive(Debug, Clone, PartialEq)]
pub enum RevertOutcome {
    Delivered { revision: Revision },
    /// The revert conflicted with later work and went to a human
    Escalated { reason: String },
    NotLanded { status: String, error: Option<String> },
}

enum ClusterRun {
    Decided(Decision),
    Awaiting,
    Deferred(String),
    Aborted(String),
}

pub struct Coordinator {
    settings: StewardConfig,
    vcs: Arc<dyn VersionControl>,
    executor: Arc<dyn BuildExecutor>,
    source: Arc<dyn ChangeSetSource>,
    sink: Arc<dyn EscalationSink>,
    registry: ChangeSetRegistry,
    builder: ClusterBuilder,
    pipeline: ResolutionPipeline,
    budget: Arc<BudgetController>,
    store: StateStore,
    checkpoints: Arc<CheckpointManager>,
    queue: Arc<MergeQueue>,
    processor: QueueProcessor,
    verdicts: Mutex<JoinSet<(String, HumanVerdict)>>,
}

impl Coordinator {
    pub async fn new(settings: StewardConfig, parts: Collaborators) -> Result<Self, CoordinatorError> {
        settings.validate()?;
        let Collaborators {
            vcs,
            executor,
            oracle,
            source,
            sink,
        } = parts;

        let state_dir = settings.repository.state_path();
        let retry = RetryPolicy::new(settings.retry.clone());
        let budget = Arc::new(BudgetController::new(settings.budget.clone()));
        let registry = ChangeSetRegistry::new(
            CompletionDetector::new(&settings.completion)?,
            RiskTagger::new(&settings.classifier.risk_paths)?,
        );
        let classifier = ConflictClassifier::new(
            vcs.clone(),
            executor.clone(),
            settings.classifier.clone(),
            retry.clone(),
        );
        let pipeline = ResolutionPipeline::new(
            vcs.clone(),
            executor.clone(),
            oracle,
            budget.clone(),
            settings.pipeline.clone(),
            settings.classifier.textual_fast_path_confidence,
            retry,
        );
        let store = StateStore::new(&state_dir);
        let checkpoints = Arc::new(
            CheckpointManager::open(
                vcs.clone(),
                budget.clone(),
                settings.repository.integration_branch.clone(),
                &state_dir,
            )
            .await?,
        );
        let queue = Arc::new(MergeQueue::new(store.clone(), settings.queue.max_queue_size));
        let processor = QueueProcessor::new(
            queue.clone(),
            vcs.clone(),
            executor.clone(),
            checkpoints.clone(),
            budget.clone(),
            settings.queue.clone(),
            settings.pipeline.clone(),
            &state_dir,
        );

        info!(
            integration_branch = %settings.repository.integration_branch,
            state_dir = %state_dir.display(),
            "Coordinator ready"
        );
        Ok(Self {
            settings,
            vcs,
            executor,
            source,
            sink,
            registry,
            builder: ClusterBuilder::new(Arc::new(classifier)),
            pipeline,
            budget,
            store,
            checkpoints,
            queue,
            processor,
            verdicts: Mutex::new(JoinSet::new()),
        })
    }

    pub fn settings(&self) -> &StewardConfig {
        &self.settings
    }

    pub fn registry(&self) -> &ChangeSetRegistry {
        &self.registry
    }

    pub fn budget(&self) -> &Arc<BudgetController> {
        &self.budget
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn queue(&self) -> &Arc<MergeQueue> {
        &self.queue
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn integration_branch(&self) -> &str {
        &self.settings.repository.integration_branch
    }

    /// Discover, classify and cluster without resolving anything
    pub async fn plan(&self) -> Result<ClusterPlan, CoordinatorError> {
        self.refresh().await?;
        let eligible = self.eligible().await;
        Ok(self.builder.build(eligible).await?)
    }

    async fn refresh(&self) -> Result<RefreshReport, CoordinatorError> {
        let report = self
            .registry
            .refresh(
                self.vcs.as_ref(),
                self.source.as_ref(),
                self.integration_branch(),
                Utc::now(),
            )
            .await?;
        debug!(
            discovered = report.discovered,
            complete = report.complete.len(),
            stale = report.stale.len(),
            "Registry refreshed"
        );
        Ok(report)
    }

    /// Eligible change sets minus the ones already live at their current head
    async fn eligible(&self) -> Vec<ChangeSet> {
        let provenance = self.checkpoints.provenance().await;
        let (delivered, pending): (Vec<ChangeSet>, Vec<ChangeSet>) = self
            .registry
            .eligible()
            .await
            .into_iter()
            .partition(|cs| provenance.is_delivered(&cs.id, &cs.head_revision));
        if !delivered.is_empty() {
            let ids: Vec<ChangeSetId> = delivered.into_iter().map(|cs| cs.id).collect();
            debug!(change_sets = ?ids, "Already delivered at current head");
            self.registry.mark_resolved(&ids).await;
        }
        pending
    }

    /// Run one full cycle
    pub async fn run_cycle(&self) -> Result<CycleReport, CoordinatorError> {
        let correlation_id = generate_correlation_id();
        let span = create_cycle_span(&correlation_id);
        self.cycle(correlation_id).instrument(span).await
    }

    async fn cycle(&self, correlation_id: String) -> Result<CycleReport, CoordinatorError> {
        pipeline_metrics().record_cycle();
        let mut report = CycleReport {
            correlation_id: correlation_id.clone(),
            ..Default::default()
        };
        report.refresh = self.refresh().await?;

        // Entries a previous cycle could not drain
        self.drain(&mut report).await?;
        if report.queue_busy {
            return Ok(report);
        }

        let eligible = self.eligible().await;
        if eligible.is_empty() {
            debug!("Nothing eligible for resolution");
            return Ok(report);
        }

        // A wave-ordering cycle is a hard error before any pipeline starts
        let plan = self.builder.build(eligible).await?;
        pipeline_metrics().record_clusters(plan.clusters.len());
        for cluster in &plan.clusters {
            self.store.upsert(RecordKind::Cluster, cluster.id.as_str(), cluster).await?;
        }
        report.clusters = plan.clusters.len();
        report.waves = plan.waves.len();
        info!(clusters = report.clusters, waves = report.waves, "Cluster plan ready");

        // Clusters that reached a Decision in this cycle
        let mut decided: BTreeSet<ClusterId> = BTreeSet::new();
        for wave in 0..plan.waves.len() {
            let (clusters, blocked): (Vec<&Cluster>, Vec<&Cluster>) = plan
                .wave_clusters(wave)
                .into_iter()
                .partition(|cluster| undecided_dependencies(cluster, &decided).is_empty());
            for cluster in blocked {
                let waiting: Vec<&str> = undecided_dependencies(cluster, &decided)
                    .into_iter()
                    .map(ClusterId::as_str)
                    .collect();
                info!(cluster = %cluster.id, waiting_on = ?waiting, "Upstream cluster undecided, deferring");
                let run = ClusterRun::Deferred(format!("waiting on {}", waiting.join(", ")));
                self.settle(cluster, run, &mut report).await?;
            }

            let base = self.vcs.resolve(self.integration_branch()).await?;
            info!(wave, clusters = clusters.len(), base = %base.short(), "Starting wave");

            let runs = join_all(
                clusters
                    .iter()
                    .map(|cluster| self.resolve(cluster, &base, EntryPoint::Start, wave, &correlation_id)),
            )
            .await;
            for (cluster, run) in clusters.iter().zip(runs) {
                let run = run?;
                if matches!(run, ClusterRun::Decided(_) | ClusterRun::Awaiting) {
                    decided.insert(cluster.id.clone());
                }
                self.settle(cluster, run, &mut report).await?;
            }

            let drained = self.drain(&mut report).await?;
            self.requeue(&plan, drained.needs_rebase, wave, &correlation_id, &mut report)
                .await?;

            let head = self.vcs.resolve(self.integration_branch()).await?;
            self.checkpoints
                .checkpoint(&head, CheckpointReason::WaveBoundary { wave })
                .await?;
        }

        if self.settings.observability.metrics_enabled {
            pipeline_metrics().log_stats();
        }
        Ok(report)
    }

    async fn resolve(
        &self,
        cluster: &Cluster,
        base: &Revision,
        entry: EntryPoint,
        wave: usize,
        correlation_id: &str,
    ) -> Result<ClusterRun, CoordinatorError> {
        let key = ResolutionPipeline::decision_key(cluster);
        if matches!(entry, EntryPoint::Start) {
            if let Some(Decision::Escalate(previous)) = self.store.get::<Decision>(RecordKind::Decision, &key).await? {
                if !previous.reason.is_retryable() {
                    debug!(cluster = %cluster.id, reason = previous.reason.code(), "Escalation still open");
                    return Ok(ClusterRun::Awaiting);
                }
            }
        }

        let guard = match self.budget.start_run().await {
            Ok(guard) => guard,
            Err(denial) => {
                info!(cluster = %cluster.id, %denial, "Cluster deferred");
                return Ok(ClusterRun::Deferred(denial.to_string()));
            }
        };
        let span = create_resolution_span(
            "resolve_cluster",
            Some(cluster.id.as_str()),
            Some(wave),
            Some(correlation_id),
        );
        let result = self.pipeline.run(cluster, base, entry, &guard).instrument(span).await;
        match &result {
            Ok(run) => self.budget.finish_probe(&guard, !run.decision.is_escalation()),
            Err(_) => self.budget.abandon_probe(&guard),
        }

        match result {
            Ok(run) => {
                self.store
                    .upsert(RecordKind::Decision, run.decision.key(), &run.decision)
                    .await?;
                Ok(ClusterRun::Decided(run.decision))
            }
            Err(PipelineError::Input { stage, message }) => {
                let reason = format!("{stage}: {message}");
                self.registry.mark_failed(&cluster.member_ids(), &reason).await;
                Ok(ClusterRun::Aborted(reason))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle(&self, cluster: &Cluster, run: ClusterRun, report: &mut CycleReport) -> Result<(), CoordinatorError> {
        match run {
            ClusterRun::Decided(Decision::AutoResolve(resolution)) => {
                self.queue.enqueue(QueuePayload::Resolution(Box::new(resolution))).await?;
                report.auto_resolved.push(cluster.id.clone());
            }
            ClusterRun::Decided(Decision::Escalate(escalation)) => {
                report
                    .escalated
                    .push((cluster.id.clone(), escalation.reason.code().to_string()));
                self.escalate(escalation).await?;
            }
            ClusterRun::Awaiting => report.awaiting_human.push(cluster.id.clone()),
            ClusterRun::Deferred(reason) => report.deferred.push((cluster.id.clone(), reason)),
            ClusterRun::Aborted(reason) => report.aborted.push((cluster.id.clone(), reason)),
        }
        Ok(())
    }

    /// Re-run clusters whose resolution no longer lands, from candidate
    /// generation on the current head. Bounded by `max_requeues`.
    async fn requeue(
        &self,
        plan: &ClusterPlan,
        mut stuck: Vec<QueueEntry>,
        wave: usize,
        correlation_id: &str,
        report: &mut CycleReport,
    ) -> Result<(), CoordinatorError> {
        let max_requeues = self.settings.pipeline.max_requeues;
        let mut round = 0;
        loop {
            let pending: Vec<(&Cluster, Resolution)> = mem::take(&mut stuck)
                .into_iter()
                .filter_map(|entry| match entry.payload {
                    QueuePayload::Resolution(resolution) => {
                        plan.cluster(&resolution.cluster_id).map(|cluster| (cluster, *resolution))
                    }
                    QueuePayload::Rollback(_) => None,
                })
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            if round >= max_requeues {
                for (cluster, resolution) in pending {
                    warn!(cluster = %cluster.id, rounds = round, "Rebase attempts exhausted");
                    pipeline_metrics().record_escalation("rebase_exhausted");
                    report.escalated.push((cluster.id.clone(), "rebase_exhausted".to_string()));
                    self.escalate(rebase_exhausted(resolution, round)).await?;
                }
                return Ok(());
            }
            round += 1;

            let base = self.vcs.resolve(self.integration_branch()).await?;
            for (cluster, resolution) in pending {
                info!(cluster = %cluster.id, round, base = %base.short(), "Re-entering candidate generation");
                report.requeued.push(cluster.id.clone());
                let entry = EntryPoint::CandidateGeneration { memo: resolution.memo };
                let run = self.resolve(cluster, &base, entry, wave, correlation_id).await?;
                self.settle(cluster, run, report).await?;
            }
            stuck = self.drain(report).await?.needs_rebase;
        }
    }

    /// Drain the queue and reflect deliveries in the registry
    async fn drain(&self, report: &mut CycleReport) -> Result<DrainReport, CoordinatorError> {
        let drained = match self.processor.drain().await {
            Ok(drained) => drained,
            Err(QueueError::Busy(lock)) => {
                warn!(%lock, "Another process is draining the merge queue");
                report.queue_busy = true;
                return Ok(DrainReport::default());
            }
            Err(e) => return Err(e.into()),
        };
        self.apply_deliveries(&drained).await;
        report.merged.extend(drained.merged.iter().map(|e| e.key.clone()));
        report.failed.extend(drained.failed.iter().map(|e| e.key.clone()));
        Ok(drained)
    }

    async fn apply_deliveries(&self, drained: &DrainReport) {
        for entry in &drained.merged {
            match &entry.payload {
                QueuePayload::Resolution(resolution) => self.registry.mark_resolved(&resolution.members).await,
                QueuePayload::Rollback(request) => self.registry.mark_rolled_back(&request.reverts).await,
            }
        }
        for entry in &drained.failed {
            let reason = entry.error.as_deref().unwrap_or("queue delivery failed");
            self.registry.mark_failed(&entry.payload.change_sets(), reason).await;
        }
    }

    /// Persist the escalation and hand it to the sink on a background task
    async fn escalate(&self, escalation: Escalation) -> Result<(), CoordinatorError> {
        let record = EscalationRecord::from_escalation(&escalation);
        self.store
            .upsert(RecordKind::Escalation, &record.key, &record)
            .await?;
        warn!(
            cluster = %escalation.cluster_id,
            reason = record.reason_code.as_str(),
            safe_default = record.safe_default.as_str(),
            "Escalating to a human"
        );
        self.watch_verdict(escalation, record);
        Ok(())
    }

    fn watch_verdict(&self, escalation: Escalation, record: EscalationRecord) {
        let sink = self.sink.clone();
        let queue = self.queue.clone();
        let wait = Duration::from_secs(self.settings.escalation.verdict_timeout_seconds);
        let task = async move {
            let verdict = match sink.escalate(&record, wait).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(escalation = %record.key, error = %e, "Escalation sink failed");
                    HumanVerdict::TimedOut
                }
            };
            apply_verdict(&queue, &escalation, &verdict).await;
            (record.key, verdict)
        };
        self.verdicts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .spawn(task.in_current_span());
    }

    /// Watch the sink again for escalations a previous process left open.
    /// Returns how many are being watched.
    pub async fn resume_escalations(&self) -> Result<usize, CoordinatorError> {
        let decisions: Vec<Decision> = self.store.list(RecordKind::Decision).await?;
        let mut resumed = 0;
        for decision in decisions {
            let Decision::Escalate(escalation) = decision else {
                continue;
            };
            if escalation.reason.is_retryable() {
                continue;
            }
            let record = EscalationRecord::from_escalation(&escalation);
            debug!(escalation = %record.key, "Resuming open escalation");
            self.watch_verdict(escalation, record);
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "Watching escalations from an earlier run");
        }
        Ok(resumed)
    }

    /// Stop waiting on open escalations. Their records stay in the sink.
    pub fn abandon_escalations(&self) -> usize {
        let tasks = mem::take(&mut *self.verdicts.lock().unwrap_or_else(|p| p.into_inner()));
        // dropping the set aborts its tasks
        tasks.len()
    }

    /// Wait for every outstanding escalation to get a verdict or time out
    pub async fn wait_for_escalations(&self) -> Vec<(String, HumanVerdict)> {
        let mut tasks = mem::take(&mut *self.verdicts.lock().unwrap_or_else(|p| p.into_inner()));
        let mut verdicts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(verdict) => verdicts.push(verdict),
                Err(e) => warn!(error = %e, "Escalation task did not finish"),
            }
        }
        verdicts
    }

    /// Forward-revert the integration branch to a checkpoint
    pub async fn rollback_to(&self, checkpoint_id: &str) -> Result<DrainReport, CoordinatorError> {
        let request = self.checkpoints.plan_revert_to(checkpoint_id).await?;
        self.deliver_rollback(request).await
    }

    async fn deliver_rollback(&self, request: RollbackRequest) -> Result<DrainReport, CoordinatorError> {
        info!(rollback = %request.key, reverts = ?request.reverts, "Delivering rollback");
        self.queue.enqueue(QueuePayload::Rollback(request)).await?;
        let drained = self.processor.drain().await?;
        self.apply_deliveries(&drained).await;
        Ok(drained)
    }

    /// Revert one change set's contribution, keeping later work. A revert that
    /// conflicts is resolved like any other cluster.
    pub async fn revert_change_set(&self, id: &ChangeSetId) -> Result<RevertOutcome, CoordinatorError> {
        let request = match self.checkpoints.plan_selective_revert(id).await? {
            SelectiveRevert::Clean(request) => request,
            SelectiveRevert::Conflicted {
                change_set,
                branch,
                revision,
                files,
            } => match self.resolve_revert(&change_set, &branch, &revision).await? {
                Ok(request) => request,
                Err(mut escalation) => {
                    escalation.reason = EscalationReason::RevertConflict { change_set, files };
                    let reason = escalation.reason.code().to_string();
                    let decision = Decision::Escalate(escalation.clone());
                    self.store.upsert(RecordKind::Decision, decision.key(), &decision).await?;
                    self.escalate(escalation).await?;
                    return Ok(RevertOutcome::Escalated { reason });
                }
            },
        };

        let drained = self.deliver_rollback(request).await?;
        if let Some(entry) = drained.merged.first() {
            if let Some(revision) = &entry.merged_revision {
                return Ok(RevertOutcome::Delivered {
                    revision: revision.clone(),
                });
            }
        }
        let entry = drained.needs_rebase.into_iter().chain(drained.failed).next();
        Ok(RevertOutcome::NotLanded {
            status: entry.as_ref().map(|e| e.status.to_string()).unwrap_or_default(),
            error: entry.and_then(|e| e.error),
        })
    }

    /// Route a conflicting inverse commit through classification and the
    /// pipeline. `Err` carries the escalation when no candidate was accepted.
    async fn resolve_revert(
        &self,
        reverted: &ChangeSetId,
        branch: &str,
        revision: &Revision,
    ) -> Result<Result<RollbackRequest, Escalation>, CoordinatorError> {
        let change_set = self.revert_change_set_facts(branch, revision).await?;
        let plan = self.builder.build(vec![change_set]).await?;
        let Some(cluster) = plan.clusters.first() else {
            return Err(CoordinatorError::EmptyRevert(reverted.clone()));
        };
        let base = self.vcs.resolve(self.integration_branch()).await?;
        let correlation_id = generate_correlation_id();

        let decision = match self
            .resolve(cluster, &base, EntryPoint::Start, 0, &correlation_id)
            .await?
        {
            ClusterRun::Decided(decision) => decision,
            ClusterRun::Awaiting | ClusterRun::Deferred(_) | ClusterRun::Aborted(_) => {
                return Ok(Err(undecided_revert(cluster, &base, reverted)));
            }
        };
        match decision {
            Decision::AutoResolve(resolution) => Ok(Ok(RollbackRequest {
                key: resolution.key.clone(),
                target: RollbackTarget::ChangeSet { id: reverted.clone() },
                base: resolution.base.clone(),
                revision: resolution.candidate.revision.clone(),
                reverts: vec![reverted.clone()],
                description: format!("Revert change set {reverted} ({})", resolution.candidate.strategy),
            })),
            Decision::Escalate(escalation) => Ok(Err(escalation)),
        }
    }

    async fn revert_change_set_facts(&self, branch: &str, revision: &Revision) -> Result<ChangeSet, CoordinatorError> {
        let hint = ChangeSetHint::for_branch(branch);
        let id = hint.change_set_id();
        let index = HeadIndex {
            integration_head: self.vcs.resolve(self.integration_branch()).await?,
            heads: BTreeMap::from([(id.clone(), revision.clone())]),
        };
        let (facts, _) = derive_facts(self.vcs.as_ref(), self.registry.tagger(), &index, &hint, revision).await?;
        Ok(ChangeSet {
            id,
            branch: branch.to_string(),
            base_revision: facts.base_revision,
            head_revision: facts.head_revision,
            files_touched: facts.files_touched,
            exported_symbols: facts.exported_symbols,
            manifest_packages: facts.manifest_packages,
            prerequisites: BTreeSet::new(),
            status: ChangeSetStatus::Complete,
            declared_risk_flags: BTreeSet::new(),
            derived_risk_flags: facts.derived_risk_flags,
            completion_score: 1.0,
            first_seen: Utc::now(),
            last_activity: facts.last_activity,
        })
    }

    /// First delivery after the checkpoint whose tree fails to build or test
    pub async fn bisect(&self, checkpoint_id: &str) -> Result<Option<Delivery>, CoordinatorError> {
        let good = self.checkpoints.find(checkpoint_id).await?.revision;
        let executor = self.executor.clone();
        let build_timeout = Duration::from_secs(self.settings.pipeline.build_timeout_seconds);
        let test_timeout = Duration::from_secs(self.settings.pipeline.full_suite_timeout_seconds);
        let budget = self.budget.clone();

        self.checkpoints
            .bisect(&good, move |revision| {
                let executor = executor.clone();
                let budget = budget.clone();
                async move {
                    let build = executor
                        .build(&revision, build_timeout)
                        .await
                        .map_err(CoordinatorError::from)?;
                    budget.record_execution(build.duration_ms);
                    if !build.passed {
                        return Ok::<_, CoordinatorError>(false);
                    }
                    let tests = executor.test(&revision, &TestFilter::All, test_timeout).await?;
                    budget.record_execution(tests.duration_ms);
                    debug!(revision = %revision.short(), green = tests.is_green(), "Bisect probe");
                    Ok(tests.is_green())
                }
            })
            .await
    }
}

/// Dependencies of `cluster` with no Decision yet
fn undecided_dependencies<'a>(cluster: &'a Cluster, decided: &BTreeSet<ClusterId>) -> Vec<&'a ClusterId> {
    cluster.depends_on.iter().filter(|id| !decided.contains(*id)).collect()
}

fn rebase_exhausted(resolution: Resolution, attempts: u32) -> Escalation {
    Escalation {
        key: resolution.key,
        cluster_id: resolution.cluster_id,
        base: resolution.base,
        members: resolution.members,
        member_heads: resolution.member_heads,
        reason: EscalationReason::RebaseExhausted { attempts },
        ranked: vec![resolution.candidate],
        recommended: Recommendation::KeepIntegrationBranch,
        min_intent_confidence: resolution.min_intent_confidence,
        memo: resolution.memo,
        decided_at: Utc::now(),
    }
}

/// Escalation for a revert cluster that never got a decision
fn undecided_revert(cluster: &Cluster, base: &Revision, reverted: &ChangeSetId) -> Escalation {
    Escalation {
        key: ResolutionPipeline::decision_key(cluster),
        cluster_id: cluster.id.clone(),
        base: base.clone(),
        members: cluster.member_ids(),
        member_heads: cluster.members.iter().map(|m| m.head_revision.clone()).collect(),
        reason: EscalationReason::RevertConflict {
            change_set: reverted.clone(),
            files: cluster.members.iter().flat_map(|m| m.files_touched.iter().cloned()).collect(),
        },
        ranked: Vec::new(),
        recommended: Recommendation::KeepIntegrationBranch,
        min_intent_confidence: None,
        memo: Default::default(),
        decided_at: Utc::now(),
    }
}

/// A human picked one of the ranked candidates: deliver it
async fn apply_verdict(queue: &MergeQueue, escalation: &Escalation, verdict: &HumanVerdict) {
    match verdict {
        HumanVerdict::SelectOption { index } => {
            let Some(candidate) = escalation.ranked.get(*index) else {
                warn!(escalation = %escalation.key, index, "Verdict selects an unknown option");
                return;
            };
            let resolution = Resolution {
                key: operation_key(&format!("verdict:{}", escalation.key), [&candidate.revision]),
                cluster_id: escalation.cluster_id.clone(),
                base: escalation.base.clone(),
                members: escalation.members.clone(),
                member_heads: escalation.member_heads.clone(),
                candidate: candidate.clone(),
                fast_path: false,
                min_intent_confidence: escalation.min_intent_confidence,
                memo: escalation.memo.clone(),
                decided_at: Utc::now(),
            };
            info!(escalation = %escalation.key, strategy = %candidate.strategy, "Human accepted a candidate");
            if let Err(e) = queue.enqueue(QueuePayload::Resolution(Box::new(resolution))).await {
                warn!(escalation = %escalation.key, error = %e, "Could not enqueue accepted candidate");
            }
        }
        HumanVerdict::RequestExplanation { question } => {
            info!(escalation = %escalation.key, %question, "Human asked for an explanation");
        }
        HumanVerdict::CustomDirection { direction } => {
            info!(escalation = %escalation.key, %direction, "Human gave a custom direction");
        }
        HumanVerdict::TimedOut => {
            debug!(escalation = %escalation.key, "No verdict before timeout, keeping the safe default");
        }
    }
}
