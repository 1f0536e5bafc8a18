//! What the orchestration loop gets back from every invocation

use serde::Serialize;
use serde_json::Value;
use sluice_core::SluiceError;
use sluice_validation::{ValidationOutcome, ValidationStage};
use sluice_workspace::ArtifactRecord;
use std::path::PathBuf;

/// Where an invocation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// No tool is registered under the requested name
    Dispatch,
    /// A file argument could not be resolved
    Input(ValidationStage),
    /// The dataset workspace could not be created or opened
    Workspace,
    /// The tool body returned an error or panicked
    Execution,
    /// A produced file could not be registered
    Artifacts,
    /// The session was cancelled
    Cancelled,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureStage::Dispatch => write!(f, "dispatch"),
            FailureStage::Input(stage) => write!(f, "input {}", stage),
            FailureStage::Workspace => write!(f, "workspace"),
            FailureStage::Execution => write!(f, "execution"),
            FailureStage::Artifacts => write!(f, "artifact registration"),
            FailureStage::Cancelled => write!(f, "cancellation"),
        }
    }
}

/// Structured failure, safe to show an end user verbatim
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFailure {
    pub tool: String,
    pub stage: FailureStage,
    pub reason: String,
    pub suggestion: String,
}

impl ToolFailure {
    pub fn new(
        tool: impl Into<String>,
        stage: FailureStage,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            stage,
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Failure built from an input that did not resolve
    pub fn from_outcome(tool: impl Into<String>, outcome: &ValidationOutcome) -> Self {
        Self::new(
            tool,
            FailureStage::Input(outcome.stage),
            format!(
                "'{}': {}",
                outcome.arg_name,
                outcome.failure_reason.as_deref().unwrap_or("could not be resolved")
            ),
            outcome
                .suggestion
                .clone()
                .unwrap_or_else(|| "specify the file explicitly".to_string()),
        )
    }

    /// Failure built from an error raised while running the tool
    pub fn from_error(tool: impl Into<String>, error: &SluiceError) -> Self {
        let stage = match error {
            SluiceError::Cancelled => FailureStage::Cancelled,
            _ => FailureStage::Execution,
        };
        Self::new(tool, stage, error.to_string(), suggestion_for(error))
    }

    /// What was attempted, why it failed, and what to do next
    pub fn user_message(&self) -> String {
        format!(
            "Tried to run '{}', but the {} step failed: {}. Next step: {}.",
            self.tool, self.stage, self.reason, self.suggestion
        )
    }
}

fn suggestion_for(error: &SluiceError) -> String {
    match error {
        SluiceError::CircuitOpen { .. }
        | SluiceError::RetriesExhausted { .. }
        | SluiceError::AllProvidersFailed(_) => {
            let secs = error.retry_in().map(|d| d.as_secs().max(1)).unwrap_or(30);
            format!("retry in {} seconds", secs)
        }
        SluiceError::Permanent { .. } => "shorten or rephrase the request".to_string(),
        SluiceError::NoProviders => "configure a provider in .sluice/config.toml".to_string(),
        SluiceError::Cancelled => "run the operation again when ready".to_string(),
        SluiceError::Artifact(_) => {
            "run the tool that produces the missing file first, or recover the workspace artifacts"
                .to_string()
        }
        SluiceError::Io(_) | SluiceError::Workspace(_) => {
            "check that the workspace folder is writable and has free space".to_string()
        }
        _ => "check the arguments and try again".to_string(),
    }
}

/// A completed invocation
#[derive(Debug, Clone, Serialize)]
pub struct ToolSuccess {
    pub tool: String,
    pub payload: Value,
    /// Records for every file the tool produced, in production order
    pub artifacts: Vec<ArtifactRecord>,
    /// How each file argument was resolved
    pub inputs: Vec<ValidationOutcome>,
    pub workspace: PathBuf,
}

/// Result of [`ToolInvocationPipeline::invoke`](crate::ToolInvocationPipeline::invoke)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success(ToolSuccess),
    Failure(ToolFailure),
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn success(&self) -> Option<&ToolSuccess> {
        match self {
            ToolResult::Success(success) => Some(success),
            ToolResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match self {
            ToolResult::Success(_) => None,
            ToolResult::Failure(failure) => Some(failure),
        }
    }
}
