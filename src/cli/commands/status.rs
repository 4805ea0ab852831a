use anyhow::Result;

use super::Runtime;
use crate::budget::BreakerState;
use crate::queue::QueueStatus;

pub struct StatusCommand {
    pub history: usize,
}

impl StatusCommand {
    pub fn new() -> Self {
        Self { history: 10 }
    }

    pub async fn execute(&self, runtime: &Runtime) -> Result<()> {
        let coordinator = &runtime.coordinator;
        println!("🧭 MERGE STEWARD STATUS");
        println!("======================");
        println!();

        println!("🚦 MERGE QUEUE:");
        println!("───────────────");
        let entries = coordinator.queue().entries().await?;
        let waiting: Vec<_> = entries.iter().filter(|e| !e.status.is_terminal()).collect();
        if waiting.is_empty() {
            println!("   ✅ Nothing waiting to land");
        }
        for entry in &waiting {
            println!(
                "   {} #{} {} [{}]",
                icon(entry.status),
                entry.sequence,
                entry.payload.describe(),
                entry.status
            );
        }
        let mut finished: Vec<_> = entries.iter().filter(|e| e.status.is_terminal()).rev().cloned().collect();
        finished.extend(coordinator.queue().archived(self.history).await?);
        finished.truncate(self.history);
        if !finished.is_empty() {
            println!();
            println!("   Recent:");
            for entry in &finished {
                let landed = entry
                    .merged_revision
                    .as_ref()
                    .map(|r| format!(" → {}", r.short()))
                    .unwrap_or_default();
                println!(
                    "   {} #{} {}{}",
                    icon(entry.status),
                    entry.sequence,
                    entry.payload.describe(),
                    landed
                );
                if let Some(error) = &entry.error {
                    println!("      {error}");
                }
            }
        }
        println!();

        println!("🙋 OPEN ESCALATIONS:");
        println!("────────────────────");
        let pending = runtime.outbox.pending().await?;
        if pending.is_empty() {
            println!("   ✅ None");
        }
        for record in &pending {
            println!("   • {} [{}] {}", record.cluster_id, record.reason_code, record.reason);
            println!("     safe default: {}", record.safe_default);
            for option in &record.options {
                println!(
                    "     [{}] {} ({:.2}) {}",
                    option.index, option.strategy, option.total_score, option.summary
                );
            }
        }
        println!();

        println!("📦 LIVE ON {}:", coordinator.settings().repository.integration_branch);
        println!("──────────────────");
        let provenance = coordinator.checkpoints().provenance().await;
        let active = provenance.active();
        if active.is_empty() {
            println!("   (no delivered change sets)");
        }
        for (id, head) in &active {
            println!("   • {} @ {}", id, head.short());
        }
        let reverted = provenance.reverted();
        if !reverted.is_empty() {
            let ids: Vec<String> = reverted.iter().map(|id| id.to_string()).collect();
            println!("   ↩️  reverted: {}", ids.join(", "));
        }
        println!();

        println!("💰 BUDGET:");
        println!("──────────");
        let usage = coordinator.budget().usage();
        println!("   🤖 Oracle calls: {}/{}", usage.oracle_calls, usage.max_oracle_calls);
        println!(
            "   ⏱️  Execution: {:.1}/{} min",
            usage.execution_minutes, usage.max_execution_minutes
        );
        match usage.breaker {
            BreakerState::Closed => println!("   🟢 Circuit breaker closed"),
            BreakerState::Open { until } => println!("   🔴 Circuit breaker open until {until}"),
            BreakerState::HalfOpen { .. } => println!("   🟡 Circuit breaker half-open"),
        }
        Ok(())
    }
}

impl Default for StatusCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn icon(status: QueueStatus) -> &'static str {
    match status {
        QueueStatus::Pending => "⏳",
        QueueStatus::Processing => "🔄",
        QueueStatus::Merged => "✅",
        QueueStatus::Failed => "❌",
        QueueStatus::NeedsRebase => "♻️",
    }
}
