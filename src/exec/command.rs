//! Shell-command execution against a materialized revision

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{ConfigError, ExecutorConfig};
use crate::vcs::{Revision, VersionControl};

use super::{BuildExecutor, BuildReport, ExecError, LintReport, TestFilter, TestReport};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Run a shell command in `dir`, killing it when the timeout elapses
pub async fn run_shell(command: &str, dir: &std::path::Path, limit: Duration) -> Result<CommandOutput, ExecError> {
    let start = Instant::now();
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(limit, child)
        .await
        .map_err(|_| ExecError::Timeout {
            operation: command.to_string(),
            timeout_ms: limit.as_millis() as u64,
        })?
        .map_err(|e| ExecError::Launch {
            command: command.to_string(),
            message: e.to_string(),
        })?;

    Ok(CommandOutput {
        status_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// [`BuildExecutor`] running configured commands in a scratch checkout
pub struct CommandBuildExecutor {
    vcs: Arc<dyn VersionControl>,
    settings: ExecutorConfig,
    failed_test: Regex,
    passed_test: Regex,
    warning: Regex,
}

impl CommandBuildExecutor {
    pub fn new(vcs: Arc<dyn VersionControl>, settings: ExecutorConfig) -> Result<Self, ConfigError> {
        let compile = |field: &str, pattern: &str| {
            Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                field: field.to_string(),
                source,
            })
        };
        Ok(Self {
            failed_test: compile("executor.failed_test_pattern", &settings.failed_test_pattern)?,
            passed_test: compile("executor.passed_test_pattern", &settings.passed_test_pattern)?,
            warning: compile("executor.warning_pattern", &settings.warning_pattern)?,
            vcs,
            settings,
        })
    }

    async fn run_at(&self, revision: &Revision, command: &str, limit: Duration) -> Result<CommandOutput, ExecError> {
        let checkout = tempfile::Builder::new().prefix("merge-steward-").tempdir()?;
        self.vcs.materialize(revision, checkout.path()).await?;
        debug!(revision = %revision.short(), command = command, "Running command in scratch checkout");
        run_shell(command, checkout.path(), limit).await
    }

    fn test_command(&self, filter: &TestFilter) -> String {
        let names = match filter {
            TestFilter::All => String::new(),
            TestFilter::Named(names) => names.join(" "),
        };
        self.settings.test_command.replace("{filter}", &names)
    }

    fn parse_tests(&self, output: &CommandOutput) -> TestReport {
        let text = output.combined();
        let mut failed: Vec<String> = self
            .failed_test
            .captures_iter(&text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        let passed = self.passed_test.captures_iter(&text).count() as u32;

        if !output.success() && failed.is_empty() {
            warn!(status = output.status_code, "Test command failed without naming a test");
            failed.push("<suite>".to_string());
        }
        failed.sort();
        failed.dedup();

        TestReport {
            passed,
            failed,
            output: text,
            duration_ms: output.duration_ms,
        }
    }
}

#[async_trait]
impl BuildExecutor for CommandBuildExecutor {
    async fn build(&self, revision: &Revision, timeout: Duration) -> Result<BuildReport, ExecError> {
        let output = self.run_at(revision, &self.settings.build_command, timeout).await?;
        Ok(BuildReport {
            passed: output.success(),
            output: output.combined(),
            duration_ms: output.duration_ms,
        })
    }

    async fn lint(&self, revision: &Revision, timeout: Duration) -> Result<LintReport, ExecError> {
        let output = self.run_at(revision, &self.settings.lint_command, timeout).await?;
        let text = output.combined();
        let warnings = self.warning.find_iter(&text).count() as u32;
        let score = if output.success() {
            1.0 / (1.0 + f64::from(warnings) * 0.1)
        } else {
            0.0
        };
        Ok(LintReport {
            score,
            warnings,
            output: text,
            duration_ms: output.duration_ms,
        })
    }

    async fn test(&self, revision: &Revision, filter: &TestFilter, timeout: Duration) -> Result<TestReport, ExecError> {
        let command = self.test_command(filter);
        let output = self.run_at(revision, &command, timeout).await?;
        Ok(self.parse_tests(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryVcs;

    fn executor() -> CommandBuildExecutor {
        let vcs: Arc<dyn VersionControl> = Arc::new(MemoryVcs::new());
        CommandBuildExecutor::new(vcs, ExecutorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_run_shell_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_shell("echo hello", dir.path(), Duration::from_secs(5)).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_shell_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_shell("sleep 5", dir.path(), Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[test]
    fn test_parse_libtest_output() {
        let output = CommandOutput {
            status_code: 101,
            stdout: "test parser::parses ... ok\ntest parser::rejects ... FAILED\n".to_string(),
            stderr: String::new(),
            duration_ms: 10,
        };
        let report = executor().parse_tests(&output);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, vec!["parser::rejects".to_string()]);
    }

    #[test]
    fn test_unnamed_failure_is_not_green() {
        let output = CommandOutput {
            status_code: 1,
            stdout: "error: could not compile".to_string(),
            stderr: String::new(),
            duration_ms: 10,
        };
        assert!(!executor().parse_tests(&output).is_green());
    }

    #[test]
    fn test_filter_substitution() {
        let exec = executor();
        assert_eq!(
            exec.test_command(&TestFilter::Named(vec!["a".into(), "b".into()])),
            "cargo test --quiet -- a b"
        );
        assert_eq!(exec.test_command(&TestFilter::All), "cargo test --quiet -- ");
    }
}
