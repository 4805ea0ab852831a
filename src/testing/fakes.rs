// Scripted collaborators for pipeline tests - no processes, no network

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use crate::escalation::{EscalationRecord, EscalationSink, HumanVerdict, SinkError};
use crate::exec::{BuildExecutor, BuildReport, ExecError, LintReport, TestFilter, TestReport};
use crate::oracle::{
    AdapterRequest, CandidateDraft, CandidateRequest, Constraint, Critique, IntentSummary, InteractionPoint,
    OracleError, ReasoningOracle, SynthesizedTest,
};
use crate::pipeline::{ResolutionContext, Strategy};
use crate::registry::{ChangeSetHint, ChangeSetId, ChangeSetSource, SourceError};
use crate::vcs::{Patch, Revision};

use super::MemoryVcs;

static PUB_FN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"pub fn ([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static FAIL_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"FAIL:([A-Za-z0-9_:]+)").unwrap());

/// Executor judging revisions by their content:
/// - build fails on `BUILD_ERROR` or a `pub fn` defined more than once
/// - each `LINT_WARN` lowers the lint score
/// - a test named `x` fails while some file contains `FAIL:x`
pub struct ScriptedExecutor {
    vcs: Arc<MemoryVcs>,
    flaky: Mutex<HashMap<String, u32>>,
    pub unavailable: AtomicBool,
    pub builds: AtomicU32,
    pub test_runs: AtomicU32,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(vcs: Arc<MemoryVcs>) -> Self {
        Self {
            vcs,
            flaky: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            builds: AtomicU32::new(0),
            test_runs: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `name` fails its next `times` runs regardless of content
    pub fn flaky(&self, name: &str, times: u32) {
        self.flaky.lock().unwrap().insert(name.to_string(), times);
    }

    fn check_available(&self, operation: &str) -> Result<(), ExecError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ExecError::Timeout {
                operation: operation.to_string(),
                timeout_ms: 0,
            });
        }
        Ok(())
    }

    fn files(&self, revision: &Revision) -> BTreeMap<String, String> {
        self.vcs.files_at(revision)
    }
}

#[async_trait]
impl BuildExecutor for ScriptedExecutor {
    async fn build(&self, revision: &Revision, _timeout: Duration) -> Result<BuildReport, ExecError> {
        self.check_available("build")?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(format!("build {revision}"));

        let files = self.files(revision);
        let mut definitions: HashMap<String, u32> = HashMap::new();
        let mut errors = Vec::new();
        for (path, content) in &files {
            if content.contains("BUILD_ERROR") {
                errors.push(format!("{path}: explicit build error"));
            }
            for captures in PUB_FN.captures_iter(content) {
                *definitions.entry(captures[1].to_string()).or_default() += 1;
            }
        }
        for (name, count) in definitions {
            if count > 1 {
                errors.push(format!("duplicate definition of `{name}`"));
            }
        }
        errors.sort();

        Ok(BuildReport {
            passed: errors.is_empty(),
            output: errors.join("\n"),
            duration_ms: 1_000,
        })
    }

    async fn lint(&self, revision: &Revision, _timeout: Duration) -> Result<LintReport, ExecError> {
        self.check_available("lint")?;
        self.calls.lock().unwrap().push(format!("lint {revision}"));
        let warnings: u32 = self
            .files(revision)
            .values()
            .map(|content| content.matches("LINT_WARN").count() as u32)
            .sum();
        Ok(LintReport {
            score: 1.0 / (1.0 + f64::from(warnings)),
            warnings,
            output: String::new(),
            duration_ms: 1_000,
        })
    }

    async fn test(&self, revision: &Revision, filter: &TestFilter, _timeout: Duration) -> Result<TestReport, ExecError> {
        self.check_available("test")?;
        self.test_runs.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(format!("test {revision} {filter:?}"));

        let files = self.files(revision);
        let mut marked: Vec<String> = files
            .values()
            .flat_map(|content| {
                FAIL_MARKER
                    .captures_iter(content)
                    .map(|c| c[1].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        marked.sort();
        marked.dedup();

        let requested: Vec<String> = match filter {
            TestFilter::All => {
                let mut all = marked.clone();
                all.extend(self.flaky.lock().unwrap().keys().cloned());
                all.push("suite_smoke".to_string());
                all.sort();
                all.dedup();
                all
            }
            TestFilter::Named(names) => names.clone(),
        };

        let mut failed = Vec::new();
        let mut flaky = self.flaky.lock().unwrap();
        for name in &requested {
            if let Some(remaining) = flaky.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    failed.push(name.clone());
                    continue;
                }
            }
            if marked.contains(name) {
                failed.push(name.clone());
            }
        }

        Ok(TestReport {
            passed: (requested.len() - failed.len()) as u32,
            failed,
            output: String::new(),
            duration_ms: 1_000,
        })
    }
}

/// Oracle answering from the context and per-test overrides
pub struct ScriptedOracle {
    confidence: Mutex<HashMap<ChangeSetId, f64>>,
    hard_constraints: Mutex<HashMap<ChangeSetId, Vec<Constraint>>>,
    critiques: Mutex<HashMap<String, Critique>>,
    adapter: Mutex<Option<Patch>>,
    candidates: Mutex<HashMap<String, Patch>>,
    pub unavailable: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            confidence: Mutex::new(HashMap::new()),
            hard_constraints: Mutex::new(HashMap::new()),
            critiques: Mutex::new(HashMap::new()),
            adapter: Mutex::new(None),
            candidates: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_confidence(&self, member: &str, confidence: f64) {
        self.confidence.lock().unwrap().insert(ChangeSetId::new(member), confidence);
    }

    pub fn set_hard_constraint(&self, member: &str, subject: &str, requirement: &str) {
        self.hard_constraints
            .lock()
            .unwrap()
            .entry(ChangeSetId::new(member))
            .or_default()
            .push(Constraint::new(subject, requirement));
    }

    /// Critique returned for a strategy label such as `member_primary:agent/a`
    pub fn set_critique(&self, strategy_label: &str, score: f64) {
        self.critiques.lock().unwrap().insert(
            strategy_label.to_string(),
            Critique {
                correctness: score,
                simplicity: score,
                convention: score,
                intent_satisfaction: score,
            },
        );
    }

    pub fn set_adapter(&self, patch: Patch) {
        *self.adapter.lock().unwrap() = Some(patch);
    }

    pub fn set_candidate(&self, strategy_label: &str, patch: Patch) {
        self.candidates.lock().unwrap().insert(strategy_label.to_string(), patch);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn log(&self, task: &str) -> Result<(), OracleError> {
        self.calls.lock().unwrap().push(task.to_string());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("scripted outage".to_string()));
        }
        Ok(())
    }

    fn combined(context: &ResolutionContext, reverse: bool) -> Patch {
        let mut patch = Patch::new();
        for file in &context.contested {
            let mut versions: Vec<&Option<String>> = file.versions.values().collect();
            if reverse {
                versions.reverse();
            }
            let mut lines: Vec<&str> = Vec::new();
            for content in versions.into_iter().flatten() {
                for line in content.lines() {
                    if !lines.contains(&line) {
                        lines.push(line);
                    }
                }
            }
            let mut text = lines.join("\n");
            text.push('\n');
            patch.write(file.path.clone(), text);
        }
        patch
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    async fn extract_intent(
        &self,
        _context: &ResolutionContext,
        member: &ChangeSetId,
    ) -> Result<IntentSummary, OracleError> {
        self.log("extract_intent")?;
        let confidence = self.confidence.lock().unwrap().get(member).copied().unwrap_or(0.9);
        let hard_constraints = self
            .hard_constraints
            .lock()
            .unwrap()
            .get(member)
            .cloned()
            .unwrap_or_default();
        Ok(IntentSummary {
            member: member.clone(),
            primary_intent: format!("changes made by {member}"),
            hard_constraints,
            soft_constraints: vec![],
            confidence,
        })
    }

    async fn propose_adapter(
        &self,
        _context: &ResolutionContext,
        _request: &AdapterRequest,
    ) -> Result<Patch, OracleError> {
        self.log("propose_adapter")?;
        Ok(self.adapter.lock().unwrap().clone().unwrap_or_default())
    }

    async fn synthesize_tests(
        &self,
        _context: &ResolutionContext,
        points: &[InteractionPoint],
        limit: usize,
    ) -> Result<Vec<SynthesizedTest>, OracleError> {
        self.log("synthesize_tests")?;
        Ok(points
            .iter()
            .enumerate()
            .take(limit + 1)
            .map(|(n, point)| SynthesizedTest {
                name: format!("interaction_{n}"),
                path: format!("tests/interaction_{n}.rs"),
                body: format!("// exercises {}\n", point.path),
                needs_review: false,
            })
            .collect())
    }

    async fn synthesize_candidate(
        &self,
        context: &ResolutionContext,
        request: &CandidateRequest,
    ) -> Result<CandidateDraft, OracleError> {
        self.log("synthesize_candidate")?;
        let label = request.strategy.label();
        if let Some(patch) = self.candidates.lock().unwrap().get(&label) {
            return Ok(CandidateDraft {
                patch: patch.clone(),
                summary: format!("scripted {label}"),
            });
        }

        let mut patch = match &request.strategy {
            Strategy::MemberPrimary(member) => {
                let mut patch = Patch::new();
                for file in &context.contested {
                    match file.versions.get(member) {
                        Some(Some(content)) => {
                            patch.write(file.path.clone(), content.clone());
                        }
                        Some(None) => {
                            patch.delete(file.path.clone());
                        }
                        None => {}
                    }
                }
                patch
            }
            Strategy::ConventionPrimary => Self::combined(context, false),
            Strategy::FreshSynthesis => Self::combined(context, true),
            Strategy::MinimalMerge | Strategy::CleanMerge => Patch::new(),
        };
        if let Some(hint) = &request.diversity_hint {
            if let Some(path) = request.contested.first() {
                let base = match patch.get(path).and_then(|e| e.content()) {
                    Some(content) => content.to_string(),
                    None => String::new(),
                };
                patch.write(path.clone(), format!("{base}// {hint}\n"));
            }
        }
        Ok(CandidateDraft {
            patch,
            summary: format!("{label} draft"),
        })
    }

    async fn critique(
        &self,
        _context: &ResolutionContext,
        strategy: &Strategy,
        _patch: &Patch,
    ) -> Result<Critique, OracleError> {
        self.log("critique")?;
        let label = strategy.label();
        Ok(self
            .critiques
            .lock()
            .unwrap()
            .get(&label)
            .cloned()
            .unwrap_or(Critique {
                correctness: 0.7,
                simplicity: 0.7,
                convention: 0.7,
                intent_satisfaction: 0.7,
            }))
    }
}

/// Sink remembering every record and answering with a fixed verdict
pub struct RecordingSink {
    pub records: Mutex<Vec<EscalationRecord>>,
    verdict: Mutex<HumanVerdict>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new(HumanVerdict::TimedOut)
    }
}

impl RecordingSink {
    pub fn new(verdict: HumanVerdict) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            verdict: Mutex::new(verdict),
        }
    }

    pub fn reason_codes(&self) -> Vec<String> {
        self.records.lock().unwrap().iter().map(|r| r.reason_code.clone()).collect()
    }
}

#[async_trait]
impl EscalationSink for RecordingSink {
    async fn escalate(&self, record: &EscalationRecord, _wait: Duration) -> Result<HumanVerdict, SinkError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(self.verdict.lock().unwrap().clone())
    }
}

/// Source returning a fixed list of hints
pub struct StaticSource {
    hints: Mutex<Vec<ChangeSetHint>>,
}

impl StaticSource {
    pub fn new(hints: Vec<ChangeSetHint>) -> Self {
        Self {
            hints: Mutex::new(hints),
        }
    }

    pub fn set(&self, hints: Vec<ChangeSetHint>) {
        *self.hints.lock().unwrap() = hints;
    }
}

#[async_trait]
impl ChangeSetSource for StaticSource {
    async fn discover(&self) -> Result<Vec<ChangeSetHint>, SourceError> {
        Ok(self.hints.lock().unwrap().clone())
    }
}
