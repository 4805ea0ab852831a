use anyhow::Result;

use super::Runtime;
use crate::coordinator::RevertOutcome;
use crate::registry::ChangeSetId;

pub enum RollbackScope {
    Checkpoint(String),
    ChangeSet(ChangeSetId),
}

pub struct RollbackCommand {
    pub target: RollbackScope,
}

impl RollbackCommand {
    pub fn to_checkpoint(id: impl Into<String>) -> Self {
        Self {
            target: RollbackScope::Checkpoint(id.into()),
        }
    }

    pub fn change_set(id: impl Into<String>) -> Self {
        Self {
            target: RollbackScope::ChangeSet(ChangeSetId::new(id)),
        }
    }

    pub async fn execute(&self, runtime: &Runtime) -> Result<()> {
        let coordinator = &runtime.coordinator;
        match &self.target {
            RollbackScope::Checkpoint(id) => {
                println!("⏪ Rolling back to checkpoint {id}");
                println!();
                let drained = coordinator.rollback_to(id).await?;
                match drained.merged.first() {
                    Some(entry) => {
                        println!("✅ Forward revert landed");
                        if let Some(revision) = &entry.merged_revision {
                            println!("   🔖 {}", revision.short());
                        }
                        let reverted = entry.payload.change_sets();
                        if !reverted.is_empty() {
                            let ids: Vec<String> = reverted.iter().map(|id| id.to_string()).collect();
                            println!("   ↩️  reverted: {}", ids.join(", "));
                        }
                    }
                    None => {
                        println!("❌ Rollback did not land");
                        for entry in drained.failed.iter().chain(&drained.needs_rebase) {
                            if let Some(error) = &entry.error {
                                println!("   {error}");
                            }
                        }
                    }
                }
            }
            RollbackScope::ChangeSet(id) => {
                println!("↩️  Reverting change set {id}");
                println!();
                match coordinator.revert_change_set(id).await? {
                    RevertOutcome::Delivered { revision } => {
                        println!("✅ Revert landed at {}; later work kept", revision.short());
                    }
                    RevertOutcome::Escalated { reason } => {
                        println!("🙋 Revert conflicts with later work and was escalated ({reason})");
                        println!("   Answer it in {}; the next run picks the verdict up", coordinator.settings().escalation.outbox_dir);
                    }
                    RevertOutcome::NotLanded { status, error } => {
                        println!("❌ Revert did not land ({status})");
                        if let Some(error) = error {
                            println!("   {error}");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
