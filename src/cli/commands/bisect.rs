use anyhow::Result;

use super::Runtime;

pub struct BisectCommand {
    pub from: String,
}

impl BisectCommand {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }

    pub async fn execute(&self, runtime: &Runtime) -> Result<()> {
        println!("🔎 Bisecting deliveries after checkpoint {}", self.from);
        println!();
        print!("🔄 Building and testing candidate revisions... ");
        super::flush();

        match runtime.coordinator.bisect(&self.from).await? {
            Some(delivery) => {
                println!("✅");
                println!();
                println!("💥 First breaking delivery: {}", delivery.revision.short());
                println!("   entry: {}", delivery.entry_key);
                for (id, head) in &delivery.members {
                    println!("   • {} @ {}", id, head.short());
                }
                println!();
                if let Some((id, _)) = delivery.members.first() {
                    println!("💡 Revert it with 'merge-steward rollback --change-set {id}'");
                }
            }
            None => {
                println!("✅");
                println!();
                println!("🟢 Every delivery since the checkpoint builds and passes the suite");
            }
        }
        Ok(())
    }
}
