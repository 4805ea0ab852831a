use anyhow::Result;

use super::Runtime;
use crate::cluster::ClusterPlan;

pub struct PlanCommand;

impl PlanCommand {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, runtime: &Runtime) -> Result<()> {
        println!("🗺️  MERGE STEWARD PLAN");
        println!("=====================");
        println!();

        print!("🔍 Discovering and classifying change sets... ");
        super::flush();
        let plan = runtime.coordinator.plan().await?;
        println!("✅");
        println!();

        render(&plan);
        Ok(())
    }
}

impl Default for PlanCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn render(plan: &ClusterPlan) {
    if plan.clusters.is_empty() {
        println!("📋 No complete change sets waiting for integration");
        println!();
        println!("💡 Branches qualify once their completion signals reach the configured threshold.");
        return;
    }

    let members: usize = plan.clusters.iter().map(|c| c.members.len()).sum();
    println!(
        "📦 {} change sets in {} clusters across {} waves",
        members,
        plan.clusters.len(),
        plan.waves.len()
    );
    println!();

    for (index, _) in plan.waves.iter().enumerate() {
        println!("🌊 Wave {}:", index + 1);
        for cluster in plan.wave_clusters(index) {
            let severity = cluster.severity();
            let marker = if cluster.members.len() == 1 { "🟢" } else { "🟠" };
            println!(
                "  {} {} ({} members, {:?}, {:?})",
                marker,
                cluster.id,
                cluster.members.len(),
                severity,
                cluster.cost_class
            );
            for member in &cluster.members {
                let risk = if member.is_high_risk() { " ⚠️  high risk" } else { "" };
                println!(
                    "     • {} @ {} ({} files){}",
                    member.id,
                    member.head_revision.short(),
                    member.files_touched.len(),
                    risk
                );
            }
            if !cluster.shared_files.is_empty() {
                let files: Vec<&str> = cluster.shared_files.iter().map(String::as_str).collect();
                println!("     📄 shared files: {}", files.join(", "));
            }
            if !cluster.depends_on.is_empty() {
                let deps: Vec<&str> = cluster.depends_on.iter().map(|d| d.as_str()).collect();
                println!("     ⛓️  after: {}", deps.join(", "));
            }
        }
        println!();
    }
}
