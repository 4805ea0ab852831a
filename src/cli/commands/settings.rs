use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::StewardConfig;

/// Prints or saves the configuration after every layer has been applied
pub struct ConfigCommand {
    pub output: Option<PathBuf>,
}

impl ConfigCommand {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }

    pub fn execute(&self, settings: &StewardConfig) -> Result<()> {
        match &self.output {
            Some(path) => {
                settings
                    .save_to_file(path)
                    .with_context(|| format!("cannot write {}", path.display()))?;
                println!("✅ Effective configuration written to {}", path.display());
            }
            None => print!("{}", toml::to_string_pretty(settings)?),
        }
        Ok(())
    }
}
