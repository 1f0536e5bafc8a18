//! Result type of input resolution

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// The resolver's layers, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStage {
    /// The caller supplied a usable value
    Parameter,
    /// The value came from the session's last-used dataset
    StateRecovery,
    /// The file was confirmed on disk, or found by fuzzy search
    Existence,
    /// A prefix of the file could be read
    Readability,
    /// Structural expectations (e.g. tabular) hold
    Format,
}

impl std::fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationStage::Parameter => write!(f, "parameter"),
            ValidationStage::StateRecovery => write!(f, "state recovery"),
            ValidationStage::Existence => write!(f, "existence"),
            ValidationStage::Readability => write!(f, "readability"),
            ValidationStage::Format => write!(f, "format"),
        }
    }
}

/// What the caller expects the file to contain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Any readable, non-empty file
    #[default]
    Any,
    /// Rows and columns: delimited text, or a known binary table format
    Tabular,
}

/// Outcome of resolving one file argument
///
/// On success `stage` is the layer that produced the path; on failure it is
/// the layer that rejected it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub arg_name: String,
    pub stage: ValidationStage,
    pub resolved_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    /// Concrete next step for the end user
    pub suggestion: Option<String>,
    /// Facts gathered along the way (size, rows, columns, format, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ValidationOutcome {
    pub fn success(
        arg_name: impl Into<String>,
        stage: ValidationStage,
        path: PathBuf,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            arg_name: arg_name.into(),
            stage,
            resolved_path: Some(path),
            failure_reason: None,
            suggestion: None,
            metadata,
        }
    }

    pub fn failure(
        arg_name: impl Into<String>,
        stage: ValidationStage,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            arg_name: arg_name.into(),
            stage,
            resolved_path: None,
            failure_reason: Some(reason.into()),
            suggestion: Some(suggestion.into()),
            metadata: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_reason.is_none() && self.resolved_path.is_some()
    }

    /// One-line rendering safe to show an end user
    pub fn user_message(&self) -> String {
        match (&self.failure_reason, &self.resolved_path) {
            (Some(reason), _) => format!(
                "Could not use '{}' ({} check failed): {}. Next step: {}.",
                self.arg_name,
                self.stage,
                reason,
                self.suggestion.as_deref().unwrap_or("specify the file explicitly")
            ),
            (None, Some(path)) => format!(
                "Using {} for '{}' (resolved at {} stage)",
                path.display(),
                self.arg_name,
                self.stage
            ),
            (None, None) => format!("'{}' was not resolved", self.arg_name),
        }
    }
}
