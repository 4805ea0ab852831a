use chrono::Utc;
use fd_lock::RwLock;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{MergeQueue, QueueEntry, QueueError, QueuePayload, QueueStatus};
use crate::budget::BudgetController;
use crate::checkpoint::{CheckpointManager, CheckpointReason, Delivery, DeliveryKind};
use crate::config::{PipelineConfig, QueueConfig};
use crate::exec::BuildExecutor;
use crate::observability::pipeline_metrics;
use crate::vcs::{Revision, VcsError, VersionControl};

fn drainer_id() -> String {
    let host = hostname::get().unwrap_or_default().to_string_lossy().to_string();
    format!("{host}:{}", std::process::id())
}

/// What one drain pass did, in processing order
#[derive(Debug, Default)]
pub struct DrainReport {
    pub merged: Vec<QueueEntry>,
    /// Entries whose candidate no longer fits the integration branch
    pub needs_rebase: Vec<QueueEntry>,
    pub failed: Vec<QueueEntry>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty() && self.needs_rebase.is_empty() && self.failed.is_empty()
    }
}

enum Landing {
    Merged { revision: Revision, rebased: bool },
    NeedsRebase(String),
}

/// Single consumer of the merge queue
pub struct QueueProcessor {
    queue: Arc<MergeQueue>,
    vcs: Arc<dyn VersionControl>,
    executor: Arc<dyn BuildExecutor>,
    checkpoints: Arc<CheckpointManager>,
    budget: Arc<BudgetController>,
    settings: QueueConfig,
    pipeline: PipelineConfig,
    state_dir: PathBuf,
}

impl QueueProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<MergeQueue>,
        vcs: Arc<dyn VersionControl>,
        executor: Arc<dyn BuildExecutor>,
        checkpoints: Arc<CheckpointManager>,
        budget: Arc<BudgetController>,
        settings: QueueConfig,
        pipeline: PipelineConfig,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            vcs,
            executor,
            checkpoints,
            budget,
            settings,
            pipeline,
            state_dir: state_dir.into(),
        }
    }

    pub fn queue(&self) -> &Arc<MergeQueue> {
        &self.queue
    }

    /// Deliver every pending entry in order. Fails with `Busy` when another
    /// process is draining.
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        fs::create_dir_all(&self.state_dir)?;
        let lock_path = self.state_dir.join(&self.settings.lock_file);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        let mut lock = RwLock::new(file);
        let mut guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(_) => {
                let holder = fs::read_to_string(&lock_path).unwrap_or_default();
                return Err(QueueError::Busy(format!("{} (held by {})", lock_path.display(), holder.trim())));
            }
        };
        guard.set_len(0)?;
        guard.write_all(drainer_id().as_bytes())?;

        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            warn!(recovered, "Re-queued entries from an interrupted drain");
        }

        let mut report = DrainReport::default();
        for entry in self.queue.pending().await? {
            let entry = self.process(entry).await?;
            match entry.status {
                QueueStatus::Merged => report.merged.push(entry),
                QueueStatus::NeedsRebase => report.needs_rebase.push(entry),
                _ => report.failed.push(entry),
            }
        }
        if !report.is_empty() {
            let archived = self.queue.archive_finished().await?;
            info!(
                merged = report.merged.len(),
                needs_rebase = report.needs_rebase.len(),
                failed = report.failed.len(),
                archived,
                "Queue drained"
            );
        }
        Ok(report)
    }

    async fn process(&self, mut entry: QueueEntry) -> Result<QueueEntry, QueueError> {
        entry.transition(QueueStatus::Processing, None)?;
        self.queue.save(&entry).await?;
        info!(entry = %entry.key, payload = %entry.payload.describe(), "Processing queue entry");

        match self.land(&mut entry).await {
            Ok(Landing::Merged { revision, rebased }) => {
                self.record(&entry, &revision).await?;
                pipeline_metrics().record_merge();
                if rebased {
                    pipeline_metrics().record_rebase();
                }
                info!(entry = %entry.key, revision = %revision.short(), rebased, "Delivered");
                entry.merged_revision = Some(revision);
                entry.transition(QueueStatus::Merged, rebased.then(|| "rebased onto moved integration head".to_string()))?;
            }
            Ok(Landing::NeedsRebase(reason)) => {
                warn!(entry = %entry.key, %reason, "Entry needs rebase");
                entry.error = Some(reason.clone());
                entry.transition(QueueStatus::NeedsRebase, Some(reason))?;
            }
            Err(e) => {
                warn!(entry = %entry.key, error = %e, "Queue entry failed");
                entry.error = Some(e.to_string());
                entry.transition(QueueStatus::Failed, Some(e.to_string()))?;
            }
        }
        self.queue.save(&entry).await?;
        Ok(entry)
    }

    async fn land(&self, entry: &mut QueueEntry) -> Result<Landing, QueueError> {
        let branch = self.checkpoints.integration_branch().to_string();
        let payload = entry.payload.clone();

        let mut attempt = 0;
        while attempt < self.settings.max_rebase_attempts.max(1) {
            attempt += 1;
            entry.attempts += 1;
            let head = self.vcs.resolve(&branch).await?;

            // Landed by an earlier drain that stopped before recording it
            if self.vcs.is_ancestor(payload.revision(), &head).await? {
                return Ok(Landing::Merged {
                    revision: payload.revision().clone(),
                    rebased: false,
                });
            }

            let (candidate, rebased) = if &head == payload.base() {
                (payload.revision().clone(), false)
            } else {
                match self.rebase(&payload, &head).await? {
                    Ok(revision) => (revision, true),
                    Err(reason) => return Ok(Landing::NeedsRebase(reason)),
                }
            };

            self.checkpoints
                .checkpoint(
                    &head,
                    CheckpointReason::BeforeCommit {
                        entry: entry.key.clone(),
                    },
                )
                .await?;

            match self.vcs.compare_and_swap(&branch, &head, &candidate).await {
                Ok(()) => return Ok(Landing::Merged { revision: candidate, rebased }),
                Err(VcsError::BaseMoved { actual, .. }) => {
                    warn!(
                        entry = %entry.key,
                        attempt,
                        moved_to = %actual.short(),
                        "Integration branch moved during commit, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Landing::NeedsRebase(format!(
            "integration branch kept moving after {attempt} attempts"
        )))
    }

    /// Three-way merge of the payload onto `head`, then the cheap validation
    /// tier. The inner error is why the entry has to go back for rebase.
    async fn rebase(&self, payload: &QueuePayload, head: &Revision) -> Result<Result<Revision, String>, QueueError> {
        let outcome = self.vcs.merge_three(payload.base(), head, payload.revision()).await?;
        if !outcome.is_clean() {
            return Ok(Err(format!("rebase conflicts in {}", outcome.conflicts.join(", "))));
        }
        let Some(merged) = outcome.merged else {
            return Ok(Err("rebase produced no tree".to_string()));
        };

        let build = self
            .executor
            .build(&merged, Duration::from_secs(self.pipeline.build_timeout_seconds))
            .await?;
        self.budget.record_execution(build.duration_ms);
        if !build.passed {
            return Ok(Err("rebased tree does not build".to_string()));
        }

        let lint = self
            .executor
            .lint(&merged, Duration::from_secs(self.pipeline.lint_timeout_seconds))
            .await?;
        self.budget.record_execution(lint.duration_ms);
        if lint.score < self.pipeline.min_lint_score {
            return Ok(Err(format!("rebased tree lint score {:.2} below floor", lint.score)));
        }
        Ok(Ok(merged))
    }

    async fn record(&self, entry: &QueueEntry, revision: &Revision) -> Result<(), QueueError> {
        let parent = self.vcs.parent(revision).await?.unwrap_or_else(|| revision.clone());
        let (kind, members) = match &entry.payload {
            QueuePayload::Resolution(resolution) => (
                DeliveryKind::Resolution {
                    cluster_id: resolution.cluster_id.clone(),
                },
                resolution
                    .members
                    .iter()
                    .cloned()
                    .zip(resolution.member_heads.iter().cloned())
                    .collect(),
            ),
            QueuePayload::Rollback(request) => (
                DeliveryKind::Rollback {
                    reverts: request.reverts.clone(),
                },
                Vec::new(),
            ),
        };
        self.checkpoints
            .record_delivery(Delivery {
                revision: revision.clone(),
                parent,
                entry_key: entry.key.clone(),
                kind,
                members,
                delivered_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}
