//! Build, lint and test execution
//!
//! Every invocation carries a hard timeout. Results are plain reports; a
//! failing build is a report, only the inability to run is an error.

mod command;

pub use command::{CommandBuildExecutor, CommandOutput};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::vcs::{Revision, VcsError};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("failed to launch '{command}': {message}")]
    Launch { command: String, message: String },

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LintReport {
    /// 1.0 means no findings
    pub score: f64,
    pub warnings: u32,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestFilter {
    All,
    Named(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: u32,
    pub failed: Vec<String>,
    pub output: String,
    pub duration_ms: u64,
}

impl TestReport {
    pub fn is_green(&self) -> bool {
        self.failed.is_empty()
    }
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn build(&self, revision: &Revision, timeout: Duration) -> Result<BuildReport, ExecError>;

    async fn lint(&self, revision: &Revision, timeout: Duration) -> Result<LintReport, ExecError>;

    async fn test(&self, revision: &Revision, filter: &TestFilter, timeout: Duration) -> Result<TestReport, ExecError>;
}

/// Test names worth running for a set of touched paths: the file stems
pub fn targeted_filter<'a>(paths: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut names: Vec<String> = paths
        .into_iter()
        .filter_map(|path| {
            let file = path.rsplit('/').next()?;
            let stem = file.split('.').next()?;
            (!stem.is_empty() && stem != "mod" && stem != "lib" && stem != "main").then(|| stem.to_string())
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targeted_filter_uses_file_stems() {
        let paths = vec![
            "src/parser.rs".to_string(),
            "src/parser/mod.rs".to_string(),
            "tests/parser.rs".to_string(),
            "web/app.test.ts".to_string(),
        ];
        assert_eq!(targeted_filter(&paths), vec!["app".to_string(), "parser".to_string()]);
    }
}
