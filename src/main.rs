use anyhow::{Context, Result};
use clap::Parser;

use merge_steward::cli::commands::bisect::BisectCommand;
use merge_steward::cli::commands::checkpoints::CheckpointsCommand;
use merge_steward::cli::commands::plan::PlanCommand;
use merge_steward::cli::commands::rollback::RollbackCommand;
use merge_steward::cli::commands::run::RunCommand;
use merge_steward::cli::commands::settings::ConfigCommand;
use merge_steward::cli::commands::status::StatusCommand;
use merge_steward::cli::commands::{show_how_to_get_started, with_runtime};
use merge_steward::cli::{Cli, Commands, RollbackArgs};
use merge_steward::config::StewardConfig;
use merge_steward::telemetry::{init_telemetry, shutdown_telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    StewardConfig::load_env_file()?;
    let settings = StewardConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;

    let Some(command) = cli.command else {
        return tokio::runtime::Runtime::new()?.block_on(show_how_to_get_started());
    };
    if let Commands::Config { output } = &command {
        return ConfigCommand::new(output.clone()).execute(&settings);
    }

    init_telemetry(&settings.observability)?;
    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match command {
            Commands::Plan => with_runtime(settings, |rt| async move { PlanCommand::new().execute(&rt).await }).await,
            Commands::Run { once } => {
                with_runtime(settings, |rt| async move { RunCommand::new(once).execute(&rt).await }).await
            }
            Commands::Status => {
                with_runtime(settings, |rt| async move { StatusCommand::new().execute(&rt).await }).await
            }
            Commands::Checkpoints { limit } => {
                with_runtime(settings, |rt| async move { CheckpointsCommand::new(limit).execute(&rt).await }).await
            }
            Commands::Rollback(RollbackArgs { to, change_set }) => {
                let command = match (to, change_set) {
                    (Some(checkpoint), _) => RollbackCommand::to_checkpoint(checkpoint),
                    (None, Some(id)) => RollbackCommand::change_set(id),
                    (None, None) => anyhow::bail!("rollback needs --to or --change-set"),
                };
                with_runtime(settings, |rt| async move { command.execute(&rt).await }).await
            }
            Commands::Bisect { from } => {
                with_runtime(settings, |rt| async move { BisectCommand::new(from).execute(&rt).await }).await
            }
            Commands::Config { .. } => Ok(()),
        }
    });
    shutdown_telemetry();
    result
}
