//! The tool invocation façade
//!
//! `invoke` runs a tool through five steps, and every step that fails turns
//! into a [`ToolFailure`] rather than an error:
//!
//! 1. **Dispatch**: look the tool up by name
//! 2. **Inputs**: resolve each declared file argument
//! 3. **Workspace**: ensure the session's workspace for the dataset
//! 4. **Execution**: run the body, racing session cancellation and catching panics
//! 5. **Artifacts**: register every produced file, paced by the artifact bucket

use crate::activity_logger::{ActivityEntry, ActivityLogger};
use crate::builtin::{InsightTool, SummarizeTool};
use crate::result::{FailureStage, ToolFailure, ToolResult, ToolSuccess};
use crate::tool::{Tool, ToolContext};
use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use sluice_core::{Result, SessionContext, SluiceConfig, SluiceError, SubareaKind};
use sluice_resilience::{ProviderRouter, TokenBucket};
use sluice_validation::InputResolver;
use sluice_workspace::{
    sanitize_dataset_name, split_versioned, ArtifactRecord, ArtifactRegistry, Workspace,
    WorkspaceManager, PLACEHOLDER_DATASET,
};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Source tool recorded for uploaded datasets
pub const UPLOAD_SOURCE: &str = "upload";

/// Cached registries kept before idle ones are dropped
const REGISTRY_CACHE_LIMIT: usize = 64;

type RegistryCell = Arc<OnceCell<Arc<ArtifactRegistry>>>;

/// Runs tools on behalf of sessions
///
/// Built once per process and shared by every session. The router and the
/// artifact bucket are shared state; workspaces and registries are per
/// dataset generation. At most [`REGISTRY_CACHE_LIMIT`] registries stay
/// cached; past that, registries no invocation holds are dropped and
/// reloaded from their manifest on next use.
pub struct ToolInvocationPipeline {
    tools: HashMap<String, Arc<dyn Tool>>,
    resolver: InputResolver,
    workspaces: WorkspaceManager,
    router: Option<Arc<ProviderRouter>>,
    artifact_bucket: Arc<TokenBucket>,
    registries: Mutex<HashMap<PathBuf, RegistryCell>>,
}

impl ToolInvocationPipeline {
    pub fn new(
        resolver: InputResolver,
        workspaces: WorkspaceManager,
        artifact_bucket: Arc<TokenBucket>,
    ) -> Self {
        Self {
            tools: HashMap::new(),
            resolver,
            workspaces,
            router: None,
            artifact_bucket,
            registries: Mutex::new(HashMap::new()),
        }
    }

    /// Pipeline with the resolver, workspace manager and artifact bucket
    /// described by `config`, and no tools or providers yet
    pub fn from_config(config: &SluiceConfig) -> Self {
        Self::new(
            InputResolver::from_config(config),
            WorkspaceManager::from_config(&config.workspace),
            Arc::new(TokenBucket::from_config("artifact-save", &config.artifact_rate_limit)),
        )
    }

    pub fn with_router(mut self, router: Arc<ProviderRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register_tool(Arc::new(tool));
        self
    }

    /// Add `summarize` and `insight`
    pub fn with_builtin_tools(self) -> Self {
        self.with_tool(SummarizeTool).with_tool(InsightTool)
    }

    /// Register a tool, replacing any tool of the same name
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        if self.tools.insert(tool.name().to_string(), tool.clone()).is_some() {
            warn!(tool = %tool.name(), "Replaced an existing tool registration");
        }
    }

    /// Registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn resolver(&self) -> &InputResolver {
        &self.resolver
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn router(&self) -> Option<&Arc<ProviderRouter>> {
        self.router.as_ref()
    }

    pub fn artifact_bucket(&self) -> &TokenBucket {
        &self.artifact_bucket
    }

    /// The shared registry for `workspace`
    ///
    /// The first request for a workspace loads its records through
    /// [`ArtifactRegistry::recover`], so a new process (or a new session
    /// attaching to an existing generation) sees what is already there.
    pub async fn registry_for(&self, workspace: &Workspace) -> Arc<ArtifactRegistry> {
        let cell = self.registry_cell(workspace.root_path()).await;
        let registry = cell.get_or_init(|| load_registry(workspace)).await.clone();
        registry
    }

    /// The cache slot for one workspace; the map lock is held only here
    async fn registry_cell(&self, root: &Path) -> RegistryCell {
        let mut registries = self.registries.lock().await;
        if let Some(cell) = registries.get(root) {
            return cell.clone();
        }

        if registries.len() >= REGISTRY_CACHE_LIMIT {
            let before = registries.len();
            registries.retain(|_, cell| {
                Arc::strong_count(cell) > 1
                    || cell.get().map_or(false, |r| Arc::strong_count(r) > 1)
            });
            debug!(evicted = before - registries.len(), "Dropped idle artifact registries");
        }

        let cell = RegistryCell::default();
        registries.insert(root.to_path_buf(), cell.clone());
        cell
    }

    /// Copy an uploaded dataset into its workspace's `raw` subarea
    ///
    /// The upload becomes the session's last dataset, so later invocations
    /// without a file argument resolve to it.
    pub async fn register_upload(
        &self,
        source: &Path,
        session: &dyn SessionContext,
    ) -> Result<ArtifactRecord> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SluiceError::Artifact(format!("{} is not a file", source.display())))?;

        let workspace = self.workspaces.ensure(&file_name, session).await?;
        let registry = self.registry_for(&workspace).await;

        self.artifact_bucket
            .acquire_cancellable(1.0, self.artifact_bucket.default_max_wait(), &session.cancellation())
            .await?;
        let record = registry
            .register(&file_name, source, SubareaKind::Raw, UPLOAD_SOURCE)
            .await?;

        session.set_last_dataset(record.path.clone());
        info!(
            session = session.session_id(),
            dataset = %record.name,
            version = record.version,
            workspace = %workspace.root_path().display(),
            "Registered upload"
        );
        Ok(record)
    }

    /// Run `tool_name` with `args` for `session`
    ///
    /// Always returns a [`ToolResult`]; nothing a tool does (including
    /// panicking) escapes as an error.
    pub async fn invoke(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
        session: &dyn SessionContext,
    ) -> ToolResult {
        let started = Instant::now();
        let mut activity = ActivityEntry {
            timestamp: Utc::now(),
            session: session.session_id().to_string(),
            tool: tool_name.to_string(),
            success: false,
            duration_ms: 0,
            stage: None,
            reason: None,
            artifacts: Vec::new(),
            inputs: Vec::new(),
        };

        let result = self.run_stages(tool_name, args, session, &mut activity).await;

        activity.duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            ToolResult::Success(success) => {
                activity.success = true;
                info!(
                    tool = %tool_name,
                    session = session.session_id(),
                    artifacts = success.artifacts.len(),
                    duration_ms = activity.duration_ms,
                    "Tool invocation succeeded"
                );
            }
            ToolResult::Failure(failure) => {
                activity.stage = Some(failure.stage.to_string());
                activity.reason = Some(failure.reason.clone());
                warn!(
                    tool = %tool_name,
                    session = session.session_id(),
                    stage = %failure.stage,
                    reason = %failure.reason,
                    "Tool invocation failed"
                );
            }
        }

        if let Some(root) = session.workspace_root() {
            ActivityLogger::for_workspace(&root).record(&activity).await;
        }
        result
    }

    async fn run_stages(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
        session: &dyn SessionContext,
        activity: &mut ActivityEntry,
    ) -> ToolResult {
        let cancel = session.cancellation();

        let tool = match self.tools.get(tool_name) {
            Some(tool) => tool.clone(),
            None => {
                return ToolResult::Failure(ToolFailure::new(
                    tool_name,
                    FailureStage::Dispatch,
                    format!("unknown tool '{}'", tool_name),
                    format!("use one of: {}", self.tool_names().join(", ")),
                ))
            }
        };
        if cancel.is_cancelled() {
            return ToolResult::Failure(ToolFailure::from_error(tool_name, &SluiceError::Cancelled));
        }

        // Inputs
        let mut outcomes = Vec::new();
        let mut inputs = BTreeMap::new();
        for param in tool.file_params() {
            let provided = args.get(&param.name).and_then(Value::as_str);
            let outcome = self
                .resolver
                .resolve(&param.name, provided, param.kind, session)
                .await;
            match &outcome.resolved_path {
                Some(path) if outcome.is_success() => {
                    activity.inputs.push(path.clone());
                    inputs.insert(param.name.clone(), path.clone());
                }
                _ => return ToolResult::Failure(ToolFailure::from_outcome(tool_name, &outcome)),
            }
            outcomes.push(outcome);
        }

        // Workspace
        let dataset = self.dataset_for(inputs.values().next().map(PathBuf::as_path), session);
        let workspace = match self.workspaces.ensure(&dataset, session).await {
            Ok(workspace) => workspace,
            Err(e) => {
                return ToolResult::Failure(ToolFailure::new(
                    tool_name,
                    FailureStage::Workspace,
                    e.to_string(),
                    "check that the workspace folder is writable and has free space",
                ))
            }
        };
        let registry = self.registry_for(&workspace).await;

        // Execution
        let ctx = ToolContext {
            args,
            inputs,
            registry: registry.clone(),
            router: self.router.clone(),
            cancel: cancel.clone(),
        };
        let body = AssertUnwindSafe(tool.run(ctx)).catch_unwind();
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SluiceError::Cancelled),
            finished = body => match finished {
                Ok(result) => result,
                Err(panic) => {
                    return ToolResult::Failure(ToolFailure::new(
                        tool_name,
                        FailureStage::Execution,
                        format!("the tool crashed: {}", panic_message(panic.as_ref())),
                        "try again with different arguments, or report the problem",
                    ))
                }
            },
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => return ToolResult::Failure(ToolFailure::from_error(tool_name, &e)),
        };

        // Artifacts
        let mut artifacts = Vec::with_capacity(output.produced.len());
        for produced in output.produced {
            let registered = async {
                self.artifact_bucket
                    .acquire_cancellable(1.0, self.artifact_bucket.default_max_wait(), &cancel)
                    .await?;
                registry
                    .register(&produced.name, &produced.path, produced.subarea, tool.name())
                    .await
            }
            .await;

            match registered {
                Ok(record) => {
                    activity
                        .artifacts
                        .push(format!("{}@v{}", record.name, record.version));
                    artifacts.push(record);
                }
                Err(SluiceError::Cancelled) => {
                    return ToolResult::Failure(ToolFailure::from_error(tool_name, &SluiceError::Cancelled))
                }
                Err(e) => {
                    return ToolResult::Failure(ToolFailure::new(
                        tool_name,
                        FailureStage::Artifacts,
                        format!("could not save '{}': {}", produced.name, e),
                        "check free disk space, then run the tool again",
                    ))
                }
            }
        }

        ToolResult::Success(ToolSuccess {
            tool: tool_name.to_string(),
            payload: output.payload,
            artifacts,
            inputs: outcomes,
            workspace: workspace.root_path().to_path_buf(),
        })
    }

    /// Dataset name for the workspace an invocation runs in
    ///
    /// A file inside the workspace tree belongs to the dataset directory it
    /// sits under; any other file names the dataset after itself. Without
    /// inputs, the session's bound workspace keeps its dataset.
    fn dataset_for(&self, input: Option<&Path>, session: &dyn SessionContext) -> String {
        if let Some(path) = input {
            if let Ok(relative) = path.strip_prefix(self.workspaces.root()) {
                if let Some(first) = relative.components().next() {
                    return first.as_os_str().to_string_lossy().to_string();
                }
            }
            if let Some(name) = path.file_name() {
                let (logical, _) = split_versioned(&name.to_string_lossy());
                return sanitize_dataset_name(&logical);
            }
        }

        session
            .workspace_root()
            .and_then(|root| {
                root.parent()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| PLACEHOLDER_DATASET.to_string())
    }
}

async fn load_registry(workspace: &Workspace) -> Arc<ArtifactRegistry> {
    let registry = Arc::new(ArtifactRegistry::new(workspace.clone()));
    let report = registry.recover().await;
    if report.is_complete() {
        debug!(
            workspace = %workspace.root_path().display(),
            artifacts = report.records.len(),
            "Loaded artifact registry"
        );
    } else {
        warn!(
            workspace = %workspace.root_path().display(),
            artifacts = report.records.len(),
            warnings = report.warnings.len(),
            mode = ?report.mode,
            "Artifact registry recovered with warnings"
        );
    }
    registry
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
