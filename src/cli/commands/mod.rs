use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StewardConfig;
use crate::coordinator::{Collaborators, Coordinator};
use crate::escalation::OutboxEscalationSink;
use crate::exec::CommandBuildExecutor;
use crate::oracle::{CommandOracle, ReasoningOracle, UnconfiguredOracle};
use crate::registry::GitBranchSource;
use crate::vcs::{Git2Vcs, VersionControl};

pub mod bisect;
pub mod checkpoints;
pub mod plan;
pub mod rollback;
pub mod run;
pub mod settings;
pub mod status;

/// A coordinator wired to the local repository, plus the outbox it escalates into
pub struct Runtime {
    pub coordinator: Coordinator,
    pub outbox: Arc<OutboxEscalationSink>,
}

impl Runtime {
    pub async fn connect(settings: StewardConfig) -> Result<Self> {
        let root = Path::new(&settings.repository.path).to_path_buf();
        let vcs: Arc<dyn VersionControl> = Arc::new(
            Git2Vcs::open(&root)
                .with_context(|| format!("cannot open repository at {}", root.display()))?,
        );
        let executor = Arc::new(
            CommandBuildExecutor::new(vcs.clone(), settings.executor.clone())
                .context("invalid executor configuration")?,
        );
        let oracle: Arc<dyn ReasoningOracle> = match &settings.oracle.command {
            Some(command) => Arc::new(CommandOracle::new(
                command.clone(),
                Duration::from_secs(settings.oracle.timeout_seconds),
            )),
            None => {
                tracing::warn!("No oracle command configured; conflicting clusters will be escalated");
                Arc::new(UnconfiguredOracle)
            }
        };
        let source = Arc::new(GitBranchSource::new(
            vcs.clone(),
            settings.repository.branch_prefix.clone(),
            root.join(&settings.repository.hints_dir),
        ));
        let outbox = Arc::new(OutboxEscalationSink::new(
            root.join(&settings.escalation.outbox_dir),
            Duration::from_secs(settings.escalation.poll_interval_seconds),
        ));

        let coordinator = Coordinator::new(
            settings,
            Collaborators {
                vcs,
                executor,
                oracle,
                source,
                sink: outbox.clone(),
            },
        )
        .await?;
        Ok(Self { coordinator, outbox })
    }
}

pub async fn with_runtime<F, Fut, R>(settings: StewardConfig, f: F) -> Result<R>
where
    F: FnOnce(Runtime) -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    print!("🔄 Opening repository at {}... ", settings.repository.path);
    flush();

    match Runtime::connect(settings).await {
        Ok(runtime) => {
            println!("✅");
            f(runtime).await
        }
        Err(e) => {
            println!("❌ {e:#}");
            Err(e)
        }
    }
}

pub(crate) fn flush() {
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

pub async fn show_how_to_get_started() -> Result<()> {
    println!("🧭 merge-steward - conflict clustering and resolution");
    println!();
    println!("To get started:");
    println!("  🗺️  merge-steward plan          # Group complete branches into clusters and waves");
    println!("  🚂 merge-steward run --once    # Resolve and land one cycle");
    println!("  📊 merge-steward status        # Queue, escalations and budget");
    println!();
    println!("Recovery commands:");
    println!("  📍 merge-steward checkpoints               # Recorded integration states");
    println!("  ⏪ merge-steward rollback --to <id>         # Return to a checkpoint");
    println!("  ↩️  merge-steward rollback --change-set <id> # Revert one change set");
    println!("  🔎 merge-steward bisect --from <id>         # Find the breaking delivery");
    println!();
    println!("💡 Start with 'merge-steward plan' to see what would happen.");
    Ok(())
}
