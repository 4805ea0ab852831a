use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::pipeline::{ResolutionContext, Strategy};
use crate::registry::ChangeSetId;
use crate::vcs::Patch;

use super::{
    AdapterRequest, CandidateDraft, CandidateRequest, Critique, IntentSummary, InteractionPoint, OracleError,
    ReasoningOracle, SynthesizedTest,
};

#[derive(Serialize)]
struct OracleRequest<'a, P: Serialize> {
    task: &'a str,
    context: &'a ResolutionContext,
    payload: P,
}

/// Oracle backed by an external command. Each request is one JSON document
/// on stdin; the answer is one JSON document on stdout.
pub struct CommandOracle {
    command: String,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    async fn ask<P: Serialize + Send, R: DeserializeOwned>(
        &self,
        task: &str,
        context: &ResolutionContext,
        payload: P,
    ) -> Result<R, OracleError> {
        let request = serde_json::to_vec(&OracleRequest { task, context, payload })
            .map_err(|e| OracleError::Malformed(e.to_string()))?;

        let exchange = async {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| OracleError::Unavailable(e.to_string()))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&request)
                    .await
                    .map_err(|e| OracleError::Unavailable(e.to_string()))?;
            }

            child
                .wait_with_output()
                .await
                .map_err(|e| OracleError::Unavailable(e.to_string()))
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| OracleError::Timeout {
                operation: task.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        if !output.status.success() {
            return Err(OracleError::Unavailable(format!(
                "{task} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(task = task, bytes = output.stdout.len(), "Oracle answered");
        serde_json::from_slice(&output.stdout).map_err(|e| OracleError::Malformed(format!("{task}: {e}")))
    }
}

#[derive(Serialize)]
struct IntentPayload<'a> {
    member: &'a ChangeSetId,
}

#[derive(Serialize)]
struct TestsPayload<'a> {
    points: &'a [InteractionPoint],
    limit: usize,
}

#[derive(Serialize)]
struct CritiquePayload<'a> {
    strategy: &'a Strategy,
    patch: &'a Patch,
}

#[async_trait]
impl ReasoningOracle for CommandOracle {
    async fn extract_intent(
        &self,
        context: &ResolutionContext,
        member: &ChangeSetId,
    ) -> Result<IntentSummary, OracleError> {
        let intent: IntentSummary = self.ask("extract_intent", context, IntentPayload { member }).await?;
        if &intent.member != member {
            return Err(OracleError::Malformed(format!(
                "intent for {} returned for member {}",
                intent.member, member
            )));
        }
        Ok(intent)
    }

    async fn propose_adapter(
        &self,
        context: &ResolutionContext,
        request: &AdapterRequest,
    ) -> Result<Patch, OracleError> {
        self.ask("propose_adapter", context, request).await
    }

    async fn synthesize_tests(
        &self,
        context: &ResolutionContext,
        points: &[InteractionPoint],
        limit: usize,
    ) -> Result<Vec<SynthesizedTest>, OracleError> {
        self.ask("synthesize_tests", context, TestsPayload { points, limit }).await
    }

    async fn synthesize_candidate(
        &self,
        context: &ResolutionContext,
        request: &CandidateRequest,
    ) -> Result<CandidateDraft, OracleError> {
        self.ask("synthesize_candidate", context, request).await
    }

    async fn critique(
        &self,
        context: &ResolutionContext,
        strategy: &Strategy,
        patch: &Patch,
    ) -> Result<Critique, OracleError> {
        self.ask("critique", context, CritiquePayload { strategy, patch }).await
    }
}

/// Used when no oracle command is configured; every full-pipeline run escalates
pub struct UnconfiguredOracle;

impl UnconfiguredOracle {
    fn unavailable<T>() -> Result<T, OracleError> {
        Err(OracleError::Unavailable("no oracle command configured".to_string()))
    }
}

#[async_trait]
impl ReasoningOracle for UnconfiguredOracle {
    async fn extract_intent(&self, _: &ResolutionContext, _: &ChangeSetId) -> Result<IntentSummary, OracleError> {
        Self::unavailable()
    }

    async fn propose_adapter(&self, _: &ResolutionContext, _: &AdapterRequest) -> Result<Patch, OracleError> {
        Self::unavailable()
    }

    async fn synthesize_tests(
        &self,
        _: &ResolutionContext,
        _: &[InteractionPoint],
        _: usize,
    ) -> Result<Vec<SynthesizedTest>, OracleError> {
        Self::unavailable()
    }

    async fn synthesize_candidate(
        &self,
        _: &ResolutionContext,
        _: &CandidateRequest,
    ) -> Result<CandidateDraft, OracleError> {
        Self::unavailable()
    }

    async fn critique(&self, _: &ResolutionContext, _: &Strategy, _: &Patch) -> Result<Critique, OracleError> {
        Self::unavailable()
    }
}
