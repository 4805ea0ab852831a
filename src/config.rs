use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main configuration structure for merge-steward
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StewardConfig {
    /// Repository and integration branch settings
    pub repository: RepositoryConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Change-set completion detection
    pub completion: CompletionConfig,
    /// Conflict classification
    pub classifier: ClassifierConfig,
    /// Resolution pipeline thresholds and weights
    pub pipeline: PipelineConfig,
    /// Merge queue settings
    pub queue: QueueConfig,
    /// Cost ceilings and circuit breaker
    pub budget: BudgetConfig,
    /// Retry policy for external calls
    pub retry: RetryConfig,
    /// Build/test/lint commands
    pub executor: ExecutorConfig,
    /// Reasoning oracle adapter
    pub oracle: OracleConfig,
    /// Human escalation outbox
    pub escalation: EscalationConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("invalid pattern in {field}: {source}")]
    Pattern {
        field: String,
        #[source]
        source: regex::Error,
    },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryConfig {
    /// Path to the git repository
    pub path: String,
    /// Shared branch every resolution lands on
    pub integration_branch: String,
    /// Prefix of worker branches to discover
    pub branch_prefix: String,
    /// Directory for persisted records (decisions, queue, checkpoints)
    pub state_dir: String,
    /// Directory holding self-reported worker hints
    pub hints_dir: String,
    /// Delay between resolution cycles in `run` mode
    pub poll_interval_seconds: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: ".".to_string(),
            integration_branch: "main".to_string(),
            branch_prefix: "agent".to_string(),
            state_dir: ".merge-steward".to_string(),
            hints_dir: ".merge-steward/hints".to_string(),
            poll_interval_seconds: 60,
        }
    }
}

impl RepositoryConfig {
    pub fn state_path(&self) -> PathBuf {
        Path::new(&self.path).join(&self.state_dir)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON structured logs instead of human-readable lines
    pub json_logs: bool,
    /// Log pipeline counters at the end of each cycle
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_enabled: true,
        }
    }
}

/// Weights for the completion heuristic. No single weight may reach the threshold.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionConfig {
    pub explicit_marker_weight: f64,
    pub tests_passing_weight: f64,
    pub commit_convention_weight: f64,
    pub inactivity_weight: f64,
    /// Cumulative score at which a change set counts as complete
    pub threshold: f64,
    /// Commit message pattern that signals "done"
    pub convention_pattern: String,
    /// Quiet period that counts as an inactivity signal
    pub inactivity_minutes: i64,
    /// Quiet period after which a pending change set is stale
    pub stale_after_hours: i64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            explicit_marker_weight: 0.6,
            tests_passing_weight: 0.35,
            commit_convention_weight: 0.25,
            inactivity_weight: 0.2,
            threshold: 0.75,
            convention_pattern: r"(?im)^(done|complete|ready)(:|\b)".to_string(),
            inactivity_minutes: 45,
            stale_after_hours: 24,
        }
    }
}

/// Path patterns used to tag risky files
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskPathConfig {
    pub security: Vec<String>,
    pub auth: Vec<String>,
    pub schema: Vec<String>,
    pub public_interface: Vec<String>,
}

impl Default for RiskPathConfig {
    fn default() -> Self {
        Self {
            security: vec![r"(?i)(security|crypto|secret|credential|password)".to_string()],
            auth: vec![r"(?i)(auth|login|session|permission|acl)".to_string()],
            schema: vec![r"(?i)(schema|migrations?/|\.sql$|\.proto$)".to_string()],
            public_interface: vec![
                r"(?i)(^|/)(api|public|include)/".to_string(),
                r"(^|/)lib\.rs$".to_string(),
                r"(^|/)index\.(ts|js)$".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    /// Textual confidence at or above which the structural fast path is taken
    pub textual_fast_path_confidence: f64,
    pub semantic_build_timeout_seconds: u64,
    pub semantic_test_timeout_seconds: u64,
    /// Pairwise classifications run concurrently during refinement
    pub pair_concurrency: usize,
    pub cache_capacity: u64,
    pub risk_paths: RiskPathConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            textual_fast_path_confidence: 0.9,
            semantic_build_timeout_seconds: 900,
            semantic_test_timeout_seconds: 600,
            pair_concurrency: 4,
            cache_capacity: 10_000,
            risk_paths: RiskPathConfig::default(),
        }
    }
}

/// Sub-score weights for ranking candidates
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringWeights {
    pub tests: f64,
    pub lint: f64,
    pub correctness: f64,
    pub simplicity: f64,
    pub convention: f64,
    pub intent_satisfaction: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            tests: 0.3,
            lint: 0.1,
            correctness: 0.25,
            simplicity: 0.1,
            convention: 0.1,
            intent_satisfaction: 0.15,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Intent confidence below this always escalates
    pub intent_confidence_floor: f64,
    /// Minimum intent confidence for an automatic resolution
    pub auto_resolve_confidence: f64,
    /// Required lead of the top candidate over the runner-up
    pub decision_margin: f64,
    pub min_candidates: usize,
    pub max_candidates: usize,
    /// Candidates more similar than this are regenerated
    pub max_similarity: f64,
    pub max_regenerations: u32,
    pub max_synthesized_tests: usize,
    pub min_lint_score: f64,
    #[serde(default)]
    pub known_flaky_tests: Vec<String>,
    /// Score deduction per flaky test failure
    pub flaky_penalty: f64,
    pub oracle_timeout_seconds: u64,
    pub build_timeout_seconds: u64,
    pub lint_timeout_seconds: u64,
    pub targeted_test_timeout_seconds: u64,
    pub full_suite_timeout_seconds: u64,
    /// Times a cluster may return from the queue to candidate generation
    pub max_requeues: u32,
    pub scoring: ScoringWeights,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intent_confidence_floor: 0.6,
            auto_resolve_confidence: 0.75,
            decision_margin: 0.05,
            min_candidates: 3,
            max_candidates: 5,
            max_similarity: 0.92,
            max_regenerations: 2,
            max_synthesized_tests: 3,
            min_lint_score: 0.5,
            known_flaky_tests: Vec::new(),
            flaky_penalty: 0.05,
            oracle_timeout_seconds: 120,
            build_timeout_seconds: 900,
            lint_timeout_seconds: 300,
            targeted_test_timeout_seconds: 600,
            full_suite_timeout_seconds: 3600,
            max_requeues: 2,
            scoring: ScoringWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Rebase/compare-and-swap attempts per drained entry
    pub max_rebase_attempts: u32,
    /// Lock file guaranteeing a single drainer across processes
    pub lock_file: String,
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_rebase_attempts: 3,
            lock_file: "queue.lock".to_string(),
            max_queue_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitConfig {
    /// Rollbacks inside the window above which the breaker trips
    pub rollback_threshold: usize,
    pub window_minutes: i64,
    pub cooldown_minutes: i64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            rollback_threshold: 3,
            window_minutes: 60,
            cooldown_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    pub max_oracle_calls: u64,
    pub max_execution_minutes: u64,
    /// Oracle and execution ceilings refill after this many hours; 0 keeps
    /// them for the life of the process
    pub window_hours: u64,
    pub max_concurrent_pipelines: usize,
    pub circuit: CircuitConfig,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_oracle_calls: 500,
            max_execution_minutes: 600,
            window_hours: 24,
            max_concurrent_pipelines: 4,
            circuit: CircuitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub build_command: String,
    pub lint_command: String,
    /// `{filter}` is replaced by the space-separated test names
    pub test_command: String,
    pub failed_test_pattern: String,
    pub passed_test_pattern: String,
    pub warning_pattern: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            build_command: "cargo build --quiet".to_string(),
            lint_command: "cargo clippy --quiet".to_string(),
            test_command: "cargo test --quiet -- {filter}".to_string(),
            failed_test_pattern: r"(?m)^test (\S+) \.\.\. FAILED".to_string(),
            passed_test_pattern: r"(?m)^test (\S+) \.\.\. ok".to_string(),
            warning_pattern: r"(?m)^warning:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OracleConfig {
    /// Command speaking the JSON oracle protocol on stdin/stdout
    pub command: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EscalationConfig {
    pub outbox_dir: String,
    pub verdict_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            outbox_dir: ".merge-steward/escalations".to_string(),
            verdict_timeout_seconds: 3600,
            poll_interval_seconds: 5,
        }
    }
}

impl StewardConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (merge-steward.toml, .merge-steward-rc)
    /// 3. Environment variables (prefixed with MERGE_STEWARD_)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Same as [`StewardConfig::load`] with an explicit file taking precedence over the defaults
    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&StewardConfig::default())?);

        if Path::new("merge-steward.toml").exists() {
            builder = builder.add_source(File::with_name("merge-steward"));
        }

        if Path::new(".merge-steward-rc").exists() {
            builder = builder.add_source(File::with_name(".merge-steward-rc").format(config::FileFormat::Toml));
        }

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("MERGE_STEWARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let steward_config: StewardConfig = builder.build()?.try_deserialize()?;
        steward_config.validate()?;
        Ok(steward_config)
    }

    /// Reject combinations that would make the pipeline unsafe or meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        let completion = &self.completion;
        if completion.threshold <= 0.0 {
            return Err(ConfigError::invalid("completion.threshold", "must be positive"));
        }
        for (field, weight) in [
            ("completion.explicit_marker_weight", completion.explicit_marker_weight),
            ("completion.tests_passing_weight", completion.tests_passing_weight),
            ("completion.commit_convention_weight", completion.commit_convention_weight),
            ("completion.inactivity_weight", completion.inactivity_weight),
        ] {
            if weight < 0.0 {
                return Err(ConfigError::invalid(field, "must not be negative"));
            }
            if weight >= completion.threshold {
                return Err(ConfigError::invalid(
                    field,
                    "a single completion signal must not reach the threshold on its own",
                ));
            }
        }
        regex::Regex::new(&completion.convention_pattern).map_err(|source| ConfigError::Pattern {
            field: "completion.convention_pattern".to_string(),
            source,
        })?;

        let pipeline = &self.pipeline;
        for (field, value) in [
            ("pipeline.intent_confidence_floor", pipeline.intent_confidence_floor),
            ("pipeline.auto_resolve_confidence", pipeline.auto_resolve_confidence),
            ("pipeline.max_similarity", pipeline.max_similarity),
            ("pipeline.min_lint_score", pipeline.min_lint_score),
            ("classifier.textual_fast_path_confidence", self.classifier.textual_fast_path_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(field, "must be within [0, 1]"));
            }
        }
        if pipeline.auto_resolve_confidence < pipeline.intent_confidence_floor {
            return Err(ConfigError::invalid(
                "pipeline.auto_resolve_confidence",
                "must not be below the intent confidence floor",
            ));
        }
        if pipeline.min_candidates < 2 || pipeline.min_candidates > pipeline.max_candidates {
            return Err(ConfigError::invalid(
                "pipeline.min_candidates",
                "must be at least 2 and not exceed max_candidates",
            ));
        }
        if pipeline.decision_margin < 0.0 {
            return Err(ConfigError::invalid("pipeline.decision_margin", "must not be negative"));
        }
        if self.budget.max_concurrent_pipelines == 0 {
            return Err(ConfigError::invalid("budget.max_concurrent_pipelines", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        for (field, pattern) in [
            ("executor.failed_test_pattern", &self.executor.failed_test_pattern),
            ("executor.passed_test_pattern", &self.executor.passed_test_pattern),
            ("executor.warning_pattern", &self.executor.warning_pattern),
        ] {
            regex::Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                field: field.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
