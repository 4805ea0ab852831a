use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{EscalationRecord, EscalationSink, HumanVerdict, SinkError};

/// Writes `<key>.json` into an outbox directory and polls for a
/// `<key>.verdict.json` answer next to it.
pub struct OutboxEscalationSink {
    outbox: PathBuf,
    poll_interval: Duration,
}

impl OutboxEscalationSink {
    pub fn new(outbox: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            outbox: outbox.into(),
            poll_interval,
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.outbox.join(format!("{key}.json"))
    }

    fn verdict_path(&self, key: &str) -> PathBuf {
        self.outbox.join(format!("{key}.verdict.json"))
    }

    /// Escalations still waiting for a verdict
    pub async fn pending(&self) -> Result<Vec<EscalationRecord>, SinkError> {
        if !fs::try_exists(&self.outbox).await? {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.outbox).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") || name.ends_with(".verdict.json") {
                continue;
            }
            let content = fs::read_to_string(entry.path()).await?;
            let record: EscalationRecord = serde_json::from_str(&content)?;
            if !fs::try_exists(self.verdict_path(&record.key)).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[async_trait]
impl EscalationSink for OutboxEscalationSink {
    async fn escalate(&self, record: &EscalationRecord, wait: Duration) -> Result<HumanVerdict, SinkError> {
        fs::create_dir_all(&self.outbox).await?;
        let path = self.record_path(&record.key);
        if !fs::try_exists(&path).await? {
            fs::write(&path, serde_json::to_string_pretty(record)?).await?;
            info!(
                key = %record.key,
                cluster = %record.cluster_id,
                reason = %record.reason_code,
                "Escalation written to outbox"
            );
        }

        let deadline = Instant::now() + wait;
        let verdict_path = self.verdict_path(&record.key);
        loop {
            if fs::try_exists(&verdict_path).await? {
                let content = fs::read_to_string(&verdict_path).await?;
                match serde_json::from_str::<HumanVerdict>(&content) {
                    Ok(verdict) => return Ok(verdict),
                    Err(e) => warn!(key = %record.key, error = %e, "Unreadable verdict, waiting for a valid one"),
                }
            }
            if Instant::now() >= deadline {
                return Ok(HumanVerdict::TimedOut);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
