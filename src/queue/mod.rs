//! Merge queue
//!
//! The only writer of the integration branch. Entries are delivered strictly
//! in enqueue order by a single drainer; see [`QueueProcessor`]. Sequence
//! numbers are assigned under a file lock in the state directory, so several
//! steward processes may enqueue into one queue. Finished entries move to an
//! archive at the end of each drain.

mod processor;

pub use processor::{DrainReport, QueueProcessor};

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointError, RollbackRequest};
use crate::exec::ExecError;
use crate::pipeline::Resolution;
use crate::registry::ChangeSetId;
use crate::store::{operation_key, RecordKind, StateStore, StoreError};
use crate::vcs::{Revision, VcsError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("another drainer holds the queue lock at {0}")]
    Busy(String),

    #[error("queue is full ({0} entries waiting)")]
    Full(usize),

    #[error("queue entry not found: {0}")]
    NotFound(String),

    #[error("invalid queue transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("version control error: {0}")]
    Vcs(#[from] VcsError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("executor error: {0}")]
    Exec(#[from] ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Merged,
    Failed,
    NeedsRebase,
}

impl QueueStatus {
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Merged)
                | (Processing, Failed)
                | (Processing, NeedsRebase)
                | (Processing, Pending)
                | (NeedsRebase, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Merged | QueueStatus::Failed | QueueStatus::NeedsRebase)
    }
}

const SEQUENCE_LOCK: &str = "queue-sequence.lock";
const SEQUENCE_KEY: &str = "sequence";
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Next sequence number, kept apart from the entries so archiving never
/// reuses one
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct SequenceCursor {
    next: u64,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Merged => "merged",
            QueueStatus::Failed => "failed",
            QueueStatus::NeedsRebase => "needs_rebase",
        };
        f.write_str(label)
    }
}

/// What an entry delivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuePayload {
    Resolution(Box<Resolution>),
    Rollback(RollbackRequest),
}

impl QueuePayload {
    /// Entry key. A resolution re-run on a newer base is a new entry.
    pub fn key(&self) -> String {
        match self {
            QueuePayload::Resolution(resolution) => operation_key(
                &resolution.key,
                [&resolution.base, &resolution.candidate.revision],
            ),
            QueuePayload::Rollback(request) => request.key.clone(),
        }
    }

    /// Integration revision the payload was built on
    pub fn base(&self) -> &Revision {
        match self {
            QueuePayload::Resolution(resolution) => &resolution.base,
            QueuePayload::Rollback(request) => &request.base,
        }
    }

    pub fn revision(&self) -> &Revision {
        match self {
            QueuePayload::Resolution(resolution) => &resolution.candidate.revision,
            QueuePayload::Rollback(request) => &request.revision,
        }
    }

    pub fn change_sets(&self) -> Vec<ChangeSetId> {
        match self {
            QueuePayload::Resolution(resolution) => resolution.members.clone(),
            QueuePayload::Rollback(request) => request.reverts.clone(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            QueuePayload::Resolution(resolution) => format!(
                "resolve {} ({})",
                resolution.cluster_id, resolution.candidate.strategy
            ),
            QueuePayload::Rollback(request) => request.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: QueueStatus,
    pub to: QueueStatus,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: String,
    pub sequence: u64,
    pub payload: QueuePayload,
    pub status: QueueStatus,
    pub attempts: u32,
    pub merged_revision: Option<Revision>,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

impl QueueEntry {
    fn transition(&mut self, to: QueueStatus, note: Option<String>) -> Result<(), QueueError> {
        if !self.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                key: self.key.clone(),
                from: self.status,
                to,
            });
        }
        debug!(entry = %self.key, from = %self.status, to = %to, "Queue entry transition");
        self.history.push(StatusChange {
            from: self.status,
            to,
            at: Utc::now(),
            note,
        });
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added { sequence: u64 },
    AlreadyQueued { status: QueueStatus },
}

/// Persistent FIFO of deliveries. Entry keys are the operation keys of their
/// payloads, so enqueueing the same resolution twice is a no-op.
pub struct MergeQueue {
    store: StateStore,
    max_size: usize,
    write: Mutex<()>,
}

impl MergeQueue {
    pub fn new(store: StateStore, max_size: usize) -> Self {
        Self {
            store,
            max_size,
            write: Mutex::new(()),
        }
    }

    fn sequence_lock(&self) -> Result<RwLock<File>, QueueError> {
        fs::create_dir_all(self.store.root())?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.store.root().join(SEQUENCE_LOCK))?;
        Ok(RwLock::new(file))
    }

    pub async fn enqueue(&self, payload: QueuePayload) -> Result<EnqueueOutcome, QueueError> {
        let _guard = self.write.lock().await;
        let mut lock = self.sequence_lock()?;
        let _held = loop {
            match lock.try_write() {
                Ok(held) => break held,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => tokio::time::sleep(LOCK_POLL).await,
                Err(error) => return Err(error.into()),
            }
        };

        let key = payload.key();
        for kind in [RecordKind::QueueEntry, RecordKind::QueueArchive] {
            if let Some(existing) = self.store.get::<QueueEntry>(kind, &key).await? {
                debug!(entry = %key, status = %existing.status, "Payload already queued");
                return Ok(EnqueueOutcome::AlreadyQueued {
                    status: existing.status,
                });
            }
        }

        let entries = self.entries().await?;
        let waiting = entries.iter().filter(|e| e.status == QueueStatus::Pending).count();
        if waiting >= self.max_size {
            return Err(QueueError::Full(waiting));
        }
        let cursor: SequenceCursor = self
            .store
            .get(RecordKind::QueueMeta, SEQUENCE_KEY)
            .await?
            .unwrap_or_default();
        let sequence = entries
            .iter()
            .map(|e| e.sequence + 1)
            .max()
            .unwrap_or(0)
            .max(cursor.next);
        let entry = QueueEntry {
            key: key.clone(),
            sequence,
            payload,
            status: QueueStatus::Pending,
            attempts: 0,
            merged_revision: None,
            error: None,
            enqueued_at: Utc::now(),
            history: Vec::new(),
        };
        self.store.put(RecordKind::QueueEntry, &key, &entry).await?;
        self.store
            .upsert(RecordKind::QueueMeta, SEQUENCE_KEY, &SequenceCursor { next: sequence + 1 })
            .await?;
        info!(entry = %key, sequence, payload = %entry.payload.describe(), "Enqueued");
        Ok(EnqueueOutcome::Added { sequence })
    }

    /// Move entries with a final status out of the live queue. Returns how
    /// many moved.
    pub async fn archive_finished(&self) -> Result<usize, QueueError> {
        let _guard = self.write.lock().await;
        let mut lock = self.sequence_lock()?;
        let _held = loop {
            match lock.try_write() {
                Ok(held) => break held,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => tokio::time::sleep(LOCK_POLL).await,
                Err(error) => return Err(error.into()),
            }
        };

        let finished: Vec<QueueEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status.is_terminal())
            .collect();
        for entry in &finished {
            self.store.upsert(RecordKind::QueueArchive, &entry.key, entry).await?;
            self.store.remove(RecordKind::QueueEntry, &entry.key).await?;
        }
        if !finished.is_empty() {
            debug!(archived = finished.len(), "Archived finished queue entries");
        }
        Ok(finished.len())
    }

    /// Archived entries, most recent first
    pub async fn archived(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let mut entries: Vec<QueueEntry> = self.store.list(RecordKind::QueueArchive).await?;
        entries.sort_by_key(|e| std::cmp::Reverse(e.sequence));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Every live entry in enqueue order
    pub async fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let mut entries: Vec<QueueEntry> = self.store.list(RecordKind::QueueEntry).await?;
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    pub async fn pending(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .collect())
    }

    pub async fn get(&self, key: &str) -> Result<QueueEntry, QueueError> {
        self.store
            .get(RecordKind::QueueEntry, key)
            .await?
            .ok_or_else(|| QueueError::NotFound(key.to_string()))
    }

    /// Apply a validated status change and persist it
    pub async fn transition(&self, key: &str, to: QueueStatus, note: Option<String>) -> Result<QueueEntry, QueueError> {
        let _guard = self.write.lock().await;
        let mut entry = self.get(key).await?;
        entry.transition(to, note)?;
        self.store.upsert(RecordKind::QueueEntry, key, &entry).await?;
        Ok(entry)
    }

    pub(crate) async fn save(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let _guard = self.write.lock().await;
        self.store.upsert(RecordKind::QueueEntry, &entry.key, entry).await?;
        Ok(())
    }

    /// Entries left `processing` by a crashed drainer go back to pending
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let stuck: Vec<QueueEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Processing)
            .collect();
        for entry in &stuck {
            self.transition(&entry.key, QueueStatus::Pending, Some("recovered after interrupted drain".into()))
                .await?;
        }
        Ok(stuck.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::RollbackTarget;

    fn rollback(key: &str) -> QueuePayload {
        QueuePayload::Rollback(RollbackRequest {
            key: key.to_string(),
            target: RollbackTarget::Checkpoint { id: "cp".into() },
            base: Revision::new("base"),
            revision: Revision::new(format!("rev-{key}")),
            reverts: vec![],
            description: format!("rollback {key}"),
        })
    }

    fn queue(dir: &tempfile::TempDir, max_size: usize) -> MergeQueue {
        MergeQueue::new(StateStore::new(dir.path()), max_size)
    }

    #[test]
    fn test_status_transitions() {
        assert!(QueueStatus::Pending.can_transition_to(QueueStatus::Processing));
        assert!(QueueStatus::Processing.can_transition_to(QueueStatus::NeedsRebase));
        assert!(!QueueStatus::Pending.can_transition_to(QueueStatus::Merged));
        assert!(!QueueStatus::Merged.can_transition_to(QueueStatus::Pending));
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_and_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir, 10);

        assert_eq!(queue.enqueue(rollback("b")).await.unwrap(), EnqueueOutcome::Added { sequence: 0 });
        assert_eq!(queue.enqueue(rollback("a")).await.unwrap(), EnqueueOutcome::Added { sequence: 1 });
        assert_eq!(
            queue.enqueue(rollback("b")).await.unwrap(),
            EnqueueOutcome::AlreadyQueued {
                status: QueueStatus::Pending
            }
        );

        let keys: Vec<String> = queue.pending().await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir, 1);
        queue.enqueue(rollback("a")).await.unwrap();
        assert!(matches!(queue.enqueue(rollback("b")).await, Err(QueueError::Full(1))));
    }

    #[tokio::test]
    async fn test_finished_entries_are_archived_without_reusing_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir, 10);
        queue.enqueue(rollback("a")).await.unwrap();
        queue.enqueue(rollback("b")).await.unwrap();
        queue.transition("a", QueueStatus::Processing, None).await.unwrap();
        queue.transition("a", QueueStatus::Merged, None).await.unwrap();
        queue.transition("b", QueueStatus::Processing, None).await.unwrap();
        queue.transition("b", QueueStatus::Failed, None).await.unwrap();

        assert_eq!(queue.archive_finished().await.unwrap(), 2);
        assert!(queue.entries().await.unwrap().is_empty());
        let archived: Vec<String> = queue.archived(10).await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(archived, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(queue.archived(1).await.unwrap().len(), 1);

        assert_eq!(
            queue.enqueue(rollback("a")).await.unwrap(),
            EnqueueOutcome::AlreadyQueued {
                status: QueueStatus::Merged
            }
        );
        assert_eq!(queue.enqueue(rollback("c")).await.unwrap(), EnqueueOutcome::Added { sequence: 2 });
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_get_unique_increasing_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(queue(&dir, 100));

        let mut tasks = tokio::task::JoinSet::new();
        for task in 0..8 {
            let queue = queue.clone();
            tasks.spawn(async move {
                let mut sequences = Vec::new();
                for n in 0..4 {
                    match queue.enqueue(rollback(&format!("t{task}-{n}"))).await.unwrap() {
                        EnqueueOutcome::Added { sequence } => sequences.push(sequence),
                        other => panic!("unexpected {other:?}"),
                    }
                }
                sequences
            });
        }
        let mut all = Vec::new();
        while let Some(sequences) = tasks.join_next().await {
            let sequences = sequences.unwrap();
            assert!(sequences.windows(2).all(|w| w[0] < w[1]));
            all.extend(sequences);
        }

        all.sort_unstable();
        assert_eq!(all, (0..32).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected_and_history_kept() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(&dir, 10);
        queue.enqueue(rollback("a")).await.unwrap();

        assert!(matches!(
            queue.transition("a", QueueStatus::Merged, None).await,
            Err(QueueError::InvalidTransition { .. })
        ));
        queue.transition("a", QueueStatus::Processing, None).await.unwrap();
        assert_eq!(queue.recover().await.unwrap(), 1);

        let entry = queue.get("a").await.unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.history.len(), 2);
    }
}
