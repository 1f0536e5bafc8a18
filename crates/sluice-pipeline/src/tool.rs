//! Contract between the pipeline and business-logic tool bodies

use async_trait::async_trait;
use serde_json::{Map, Value};
use sluice_core::{Result, SluiceError, SubareaKind};
use sluice_resilience::{CompletionRequest, CompletionResponse, ProviderRouter};
use sluice_validation::InputKind;
use sluice_workspace::{ArtifactRegistry, Workspace};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A file argument the pipeline resolves before the tool runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileParam {
    pub name: String,
    pub kind: InputKind,
}

impl FileParam {
    pub fn new(name: impl Into<String>, kind: InputKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A file written by a tool, to be registered as an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFile {
    /// Logical artifact name, e.g. `summary.json`
    pub name: String,
    pub path: PathBuf,
    pub subarea: SubareaKind,
}

/// What a tool body returns
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub payload: Value,
    pub produced: Vec<ProducedFile>,
}

impl ToolOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            produced: Vec::new(),
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, path: PathBuf, subarea: SubareaKind) -> Self {
        self.produced.push(ProducedFile {
            name: name.into(),
            path,
            subarea,
        });
        self
    }
}

/// A unit of business logic run through the pipeline
///
/// Tools declare their file arguments up front; by the time `run` is called
/// every one of them is resolved to an existing, readable path.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn file_params(&self) -> Vec<FileParam> {
        Vec::new()
    }

    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput>;
}

/// Everything a tool body may use
pub struct ToolContext {
    pub(crate) args: Map<String, Value>,
    pub(crate) inputs: BTreeMap<String, PathBuf>,
    pub(crate) registry: Arc<ArtifactRegistry>,
    pub(crate) router: Option<Arc<ProviderRouter>>,
    pub(crate) cancel: CancellationToken,
}

impl ToolContext {
    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    /// Resolved path of a declared file argument
    pub fn input(&self, name: &str) -> Result<&Path> {
        self.inputs
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| SluiceError::Other(format!("'{}' is not a declared file argument", name)))
    }

    pub fn workspace(&self) -> &Workspace {
        self.registry.workspace()
    }

    /// Earlier artifacts of this workspace
    pub fn artifacts(&self) -> &ArtifactRegistry {
        &self.registry
    }

    /// Unique path in the workspace's `tmp` subarea for a file that will be
    /// returned in [`ToolOutput::produced`]
    pub fn scratch_path(&self, file_name: &str) -> PathBuf {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.workspace()
            .subarea(SubareaKind::Tmp)
            .join(format!("{}-{}", &token[..8], file_name))
    }

    /// Ask the provider router for a completion, honouring session
    /// cancellation
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        match &self.router {
            Some(router) => router.call(request, &self.cancel).await,
            None => Err(SluiceError::NoProviders),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
