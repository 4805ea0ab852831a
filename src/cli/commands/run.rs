use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};

use super::Runtime;
use crate::coordinator::CycleReport;
use crate::shutdown::ShutdownCoordinator;

pub struct RunCommand {
    pub once: bool,
}

impl RunCommand {
    pub fn new(once: bool) -> Self {
        Self { once }
    }

    pub async fn execute(&self, runtime: &Runtime) -> Result<()> {
        let coordinator = &runtime.coordinator;
        let interval = Duration::from_secs(coordinator.settings().repository.poll_interval_seconds.max(1));

        if self.once {
            println!("🚂 MERGE STEWARD - single cycle");
        } else {
            println!("🚂 MERGE STEWARD - cycling every {}s (ctrl-c to stop)", interval.as_secs());
        }
        println!("===============================================");
        println!();

        let resumed = coordinator.resume_escalations().await?;
        if resumed > 0 {
            println!("🙋 Watching {resumed} open escalations from an earlier run");
        }

        let shutdown = ShutdownCoordinator::default();
        let mut cycles = 0u64;
        loop {
            cycles += 1;
            let cycle = coordinator.run_cycle();
            tokio::pin!(cycle);

            let mut interrupted = false;
            let outcome = tokio::select! {
                outcome = &mut cycle => outcome,
                signal = ShutdownCoordinator::wait_for_signal() => {
                    signal?;
                    interrupted = true;
                    println!("🛑 Interrupted, letting the current cycle stop at a safe point...");
                    coordinator.budget().cancel_all();
                    cycle.await
                }
            };

            match outcome {
                Ok(report) => print_report(cycles, &report),
                Err(e) if self.once => {
                    shutdown.shutdown(coordinator).await?;
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, cycle = cycles, "Cycle failed");
                    println!("❌ Cycle {cycles} failed: {e}");
                }
            }

            if self.once || interrupted {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                signal = ShutdownCoordinator::wait_for_signal() => {
                    signal?;
                    break;
                }
            }
        }

        info!(cycles, "Resolution loop stopped");
        shutdown.shutdown(coordinator).await
    }
}

fn print_report(cycle: u64, report: &CycleReport) {
    if report.queue_busy {
        println!("⏳ Cycle {cycle}: another process is draining the merge queue, skipping");
        return;
    }
    if report.is_idle() && report.escalated.is_empty() && report.awaiting_human.is_empty() {
        println!("💤 Cycle {cycle}: nothing to integrate");
        return;
    }

    println!(
        "🔁 Cycle {cycle} ({}): {} clusters in {} waves",
        report.correlation_id, report.clusters, report.waves
    );
    if !report.auto_resolved.is_empty() {
        println!("   ✅ auto-resolved: {}", report.auto_resolved.len());
    }
    if !report.merged.is_empty() {
        println!("   🚀 landed: {}", report.merged.len());
    }
    if !report.requeued.is_empty() {
        println!("   ♻️  re-resolved on a moved base: {}", report.requeued.len());
    }
    for (cluster, reason) in &report.escalated {
        println!("   🙋 escalated {cluster}: {reason}");
    }
    if !report.awaiting_human.is_empty() {
        println!("   ⏸️  awaiting a human: {}", report.awaiting_human.len());
    }
    for (cluster, reason) in &report.deferred {
        println!("   ⏳ deferred {cluster}: {reason}");
    }
    for (cluster, reason) in &report.aborted {
        println!("   ⚠️  aborted {cluster}: {reason}");
    }
    for key in &report.failed {
        println!("   ❌ delivery failed: {key}");
    }
    if !report.refresh.stale.is_empty() {
        println!("   🕸️  stale change sets: {}", report.refresh.stale.len());
    }
    for (id, reason) in &report.refresh.unreadable {
        println!("   ⚠️  unreadable {id}: {reason}");
    }
}
