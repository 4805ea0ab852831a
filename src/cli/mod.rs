use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "merge-steward")]
#[command(about = "Conflict clustering and resolution for parallel worker branches")]
#[command(long_about = "merge-steward watches worker branches, groups the ones that conflict, \
                       resolves each group through a staged pipeline and lands the results on the \
                       integration branch through a single merge queue. Start with 'merge-steward plan' \
                       to see how the current branches would be grouped.")]
pub struct Cli {
    /// Configuration file layered over the defaults and merge-steward.toml
    #[arg(long, global = true, help = "Path to an additional TOML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover complete change sets, classify their conflicts and print the waves
    Plan,
    /// Run resolution cycles on the configured interval until interrupted
    Run {
        /// Run a single cycle and exit
        #[arg(long, help = "Run exactly one cycle, then exit")]
        once: bool,
    },
    /// Show the merge queue, open escalations and budget usage
    Status,
    /// List checkpoints recorded on the integration branch
    Checkpoints {
        /// Only show the most recent entries
        #[arg(long, default_value = "20", help = "Number of most recent checkpoints to show")]
        limit: usize,
    },
    /// Roll the integration branch back with a forward revert
    Rollback(RollbackArgs),
    /// Find the first delivery after a checkpoint that breaks the build or tests
    Bisect {
        /// Known-good checkpoint id or unique prefix
        #[arg(long, help = "Checkpoint that is known to build and pass the suite")]
        from: String,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Write the configuration to a file instead of stdout
        #[arg(long, help = "File path to write the effective configuration to")]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct RollbackArgs {
    /// Revert everything delivered after this checkpoint
    #[arg(long, help = "Checkpoint id or unique prefix to return to")]
    pub to: Option<String>,

    /// Revert a single change set and keep later work
    #[arg(long = "change-set", help = "Change set id to revert selectively")]
    pub change_set: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rollback_requires_exactly_one_target() {
        assert!(Cli::try_parse_from(["merge-steward", "rollback"]).is_err());
        assert!(Cli::try_parse_from(["merge-steward", "rollback", "--to", "a", "--change-set", "b"]).is_err());

        let cli = Cli::try_parse_from(["merge-steward", "rollback", "--change-set", "agent/one"]).unwrap();
        match cli.command {
            Some(Commands::Rollback(args)) => {
                assert_eq!(args.change_set.as_deref(), Some("agent/one"));
                assert!(args.to.is_none());
            }
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn test_run_once_flag() {
        let cli = Cli::try_parse_from(["merge-steward", "--config", "x.toml", "run", "--once"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { once: true })));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }
}
