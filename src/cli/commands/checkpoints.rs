use anyhow::Result;

use super::Runtime;
use crate::checkpoint::CheckpointReason;

pub struct CheckpointsCommand {
    pub limit: usize,
}

impl CheckpointsCommand {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub async fn execute(&self, runtime: &Runtime) -> Result<()> {
        println!("📍 CHECKPOINTS");
        println!("==============");
        println!();

        let checkpoints = runtime.coordinator.checkpoints().checkpoints().await?;
        if checkpoints.is_empty() {
            println!("📋 No checkpoints recorded yet");
            println!();
            println!("💡 Checkpoints are taken before every merge-queue commit and at each wave boundary.");
            return Ok(());
        }

        let skipped = checkpoints.len().saturating_sub(self.limit);
        for checkpoint in checkpoints.iter().skip(skipped) {
            let reason = match &checkpoint.reason {
                CheckpointReason::BeforeCommit { entry } => format!("before {}", short_key(entry)),
                CheckpointReason::WaveBoundary { wave } => format!("end of wave {}", wave + 1),
                CheckpointReason::Manual => "manual".to_string(),
            };
            println!(
                "  {}  {}  {}  {}",
                short_key(&checkpoint.id),
                checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                checkpoint.revision.short(),
                reason
            );
            if !checkpoint.change_sets.is_empty() {
                let ids: Vec<String> = checkpoint.change_sets.iter().map(|id| id.to_string()).collect();
                println!("      live: {}", ids.join(", "));
            }
        }
        if skipped > 0 {
            println!();
            println!("  … {skipped} older checkpoints not shown (use --limit)");
        }
        println!();
        println!("💡 Roll back with 'merge-steward rollback --to <id>' (a unique prefix is enough)");
        Ok(())
    }
}

fn short_key(key: &str) -> &str {
    let end = key.char_indices().nth(12).map(|(idx, _)| idx).unwrap_or(key.len());
    &key[..end]
}
