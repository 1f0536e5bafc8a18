//! Sluice CLI - run tools through the resilient invocation pipeline
//!
//! Usage:
//!   sluice init                        Write .sluice/config.toml
//!   sluice upload <file>               Copy a dataset into its workspace
//!   sluice invoke <tool> [-a key=val]  Run a tool for the current session
//!   sluice resolve [value]             Show how a file argument resolves
//!   sluice workspace ensure <dataset>  Bind the session to a workspace
//!   sluice artifacts list              List artifacts of the session workspace
//!
//! Session state (bound workspace, last dataset) persists in
//! `.sluice/session.json` between invocations.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use sluice_core::{InMemorySession, SessionContext, SessionState, SluiceConfig};
use sluice_pipeline::{ToolInvocationPipeline, ToolResult};
use sluice_resilience::{AnthropicClient, ProviderClient, ProviderRouter};
use sluice_validation::InputKind;
use sluice_workspace::Workspace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about = "Resilient tool invocation for conversational data sessions")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root holding .sluice/ (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Session file (defaults to <root>/.sluice/session.json)
    #[arg(long, global = true, value_name = "FILE")]
    session: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .sluice/config.toml
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Copy a dataset into its workspace and make it the session default
    Upload {
        /// File to upload
        file: PathBuf,
    },

    /// Run a tool
    Invoke {
        /// Tool name
        tool: String,

        /// Arguments as key=value (values are parsed as JSON when possible)
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },

    /// Show how a file argument would resolve
    Resolve {
        /// Value the caller would pass (omit to rely on session state)
        value: Option<String>,

        /// Require a tabular file
        #[arg(long)]
        tabular: bool,
    },

    /// List registered tools
    Tools,

    /// Workspace management
    Workspace {
        #[command(subcommand)]
        action: WorkspaceCommands,
    },

    /// Artifact registry inspection
    Artifacts {
        #[command(subcommand)]
        action: ArtifactCommands,
    },

    /// Forget the session (the workspace on disk is kept)
    Reset,
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// Bind the session to a workspace for a dataset
    Ensure {
        /// Dataset name
        dataset: String,
    },

    /// List generations of a dataset, newest first
    Generations {
        /// Dataset name
        dataset: String,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// List artifacts in the session workspace
    List {
        /// Only versions of this artifact
        name: Option<String>,
    },

    /// Rebuild the registry from the manifest and directory tree
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let root = cli.root.clone();
    // Init must work even when an existing config is broken
    if let Commands::Init { force } = cli.command {
        return cmd_init(&root, force);
    }

    let config = SluiceConfig::load_or_default(&root).context("Failed to load configuration")?;
    let session_path = cli
        .session
        .clone()
        .unwrap_or_else(|| root.join(".sluice/session.json"));
    let session = load_session(&session_path)?;
    let pipeline = build_pipeline(&config);

    let outcome = match cli.command {
        Commands::Init { force } => cmd_init(&root, force),
        Commands::Upload { file } => cmd_upload(&pipeline, &session, &file).await,
        Commands::Invoke { tool, args } => cmd_invoke(&pipeline, &session, &tool, &args).await,
        Commands::Resolve { value, tabular } => {
            cmd_resolve(&pipeline, &session, value.as_deref(), tabular).await
        }
        Commands::Tools => cmd_tools(&pipeline),
        Commands::Workspace { action } => cmd_workspace(&pipeline, &session, action).await,
        Commands::Artifacts { action } => cmd_artifacts(&pipeline, &session, action).await,
        Commands::Reset => {
            let fresh = InMemorySession::new();
            save_session(&session_path, &fresh)?;
            println!("Started new session {}", fresh.session_id());
            return Ok(());
        }
    };

    // Session changes are kept even when the command failed part way
    save_session(&session_path, &session)?;
    outcome
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let config_path = root.join(".sluice/config.toml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let written = SluiceConfig::write_default(root).context("Failed to write configuration")?;

    println!("Initialized Sluice in {}", root.display());
    println!("Created:");
    println!("  {}", written.display());
    println!("\nNext steps:");
    println!("  1. Set the API key variable named in [[providers]] (e.g. ANTHROPIC_API_KEY)");
    println!("  2. Run 'sluice upload <file>' to add a dataset");
    println!("  3. Run 'sluice invoke summarize'");
    Ok(())
}

fn build_pipeline(config: &SluiceConfig) -> ToolInvocationPipeline {
    let mut clients: Vec<Arc<dyn ProviderClient>> = Vec::new();
    for provider in &config.providers {
        match AnthropicClient::from_config(provider) {
            Ok(client) => clients.push(Arc::new(client)),
            Err(e) => warn!(provider = %provider.name, error = %e, "Provider disabled"),
        }
    }

    let pipeline = ToolInvocationPipeline::from_config(config).with_builtin_tools();
    if clients.is_empty() {
        pipeline
    } else {
        pipeline.with_router(Arc::new(ProviderRouter::from_config(config, clients)))
    }
}

fn load_session(path: &Path) -> Result<InMemorySession> {
    if !path.exists() {
        let session = InMemorySession::new();
        info!(session = session.session_id(), "Started new session");
        return Ok(session);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read session file {}", path.display()))?;
    let state: SessionState =
        serde_json::from_str(&content).context("Failed to parse session file")?;
    Ok(InMemorySession::from_state(state))
}

fn save_session(path: &Path, session: &InMemorySession) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&session.to_state())?)
        .with_context(|| format!("Failed to write session file {}", path.display()))?;
    Ok(())
}

/// Parse `key=value` pairs; values that are valid JSON keep their type
fn parse_args(raw: &[String]) -> Result<Map<String, Value>> {
    let mut args = Map::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("argument '{}' is not in key=value form", pair);
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        args.insert(key.trim().to_string(), value);
    }
    Ok(args)
}

async fn cmd_upload(pipeline: &ToolInvocationPipeline, session: &InMemorySession, file: &Path) -> Result<()> {
    let record = pipeline
        .register_upload(file, session)
        .await
        .with_context(|| format!("Failed to upload {}", file.display()))?;
    println!(
        "Uploaded {} as {} v{} ({} bytes)",
        file.display(),
        record.path.display(),
        record.version,
        record.size_bytes
    );
    Ok(())
}

async fn cmd_invoke(
    pipeline: &ToolInvocationPipeline,
    session: &InMemorySession,
    tool: &str,
    raw_args: &[String],
) -> Result<()> {
    let args = parse_args(raw_args)?;
    let result = pipeline.invoke(tool, args, session).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match result {
        ToolResult::Success(_) => Ok(()),
        ToolResult::Failure(failure) => bail!(failure.user_message()),
    }
}

async fn cmd_resolve(
    pipeline: &ToolInvocationPipeline,
    session: &InMemorySession,
    value: Option<&str>,
    tabular: bool,
) -> Result<()> {
    let kind = if tabular { InputKind::Tabular } else { InputKind::Any };
    let outcome = pipeline.resolver().resolve("file", value, kind, session).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if outcome.is_success() {
        Ok(())
    } else {
        bail!(outcome.user_message())
    }
}

fn cmd_tools(pipeline: &ToolInvocationPipeline) -> Result<()> {
    for name in pipeline.tool_names() {
        let description = pipeline.tool(name).map(|t| t.description()).unwrap_or_default();
        println!("{:<12} {}", name, description);
    }
    Ok(())
}

async fn cmd_workspace(
    pipeline: &ToolInvocationPipeline,
    session: &InMemorySession,
    action: WorkspaceCommands,
) -> Result<()> {
    match action {
        WorkspaceCommands::Ensure { dataset } => {
            let workspace = pipeline
                .workspaces()
                .ensure(&dataset, session)
                .await
                .context("Failed to ensure workspace")?;
            println!("{}", workspace.root_path().display());
            for (kind, path) in workspace.subareas() {
                println!("  {:<10} {}", kind.to_string(), path.display());
            }
        }
        WorkspaceCommands::Generations { dataset } => {
            let generations = pipeline
                .workspaces()
                .list_generations(&dataset)
                .await
                .context("Failed to list generations")?;
            if generations.is_empty() {
                println!("No generations for '{}'", dataset);
            }
            let bound = session.workspace_root();
            for workspace in generations {
                let marker = if bound.as_deref() == Some(workspace.root_path()) { "*" } else { " " };
                println!(
                    "{} {}  {}",
                    marker,
                    workspace.generation_id(),
                    workspace.generation().to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

async fn cmd_artifacts(
    pipeline: &ToolInvocationPipeline,
    session: &InMemorySession,
    action: ArtifactCommands,
) -> Result<()> {
    let Some(root) = session.workspace_root() else {
        bail!("This session has no workspace yet; upload a dataset or run 'sluice workspace ensure <dataset>'");
    };
    let workspace = Workspace::open(&root)
        .await
        .with_context(|| format!("Failed to open workspace {}", root.display()))?;

    match action {
        ArtifactCommands::List { name } => {
            let registry = pipeline.registry_for(&workspace).await;
            let records = match name {
                Some(name) => registry.versions(&name).await?,
                None => registry.list().await?,
            };
            if records.is_empty() {
                println!("No artifacts in {}", root.display());
            }
            for record in records {
                println!(
                    "{:<24} v{:<3} {:<8} {:>10}  {}  {}",
                    record.name,
                    record.version,
                    record.subarea.to_string(),
                    record.size_bytes,
                    record.source_tool,
                    record.path.display()
                );
            }
        }
        ArtifactCommands::Recover => {
            let registry = pipeline.registry_for(&workspace).await;
            let report = registry.recover().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_complete() {
                warn!(warnings = report.warnings.len(), "Recovery was partial");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args_keeps_json_types() {
        let args = parse_args(&[
            "dataset=sales.csv".to_string(),
            "limit=10".to_string(),
            "question=Which region is best?".to_string(),
        ])
        .unwrap();
        assert_eq!(args["dataset"], "sales.csv");
        assert_eq!(args["limit"], 10);
        assert_eq!(args["question"], "Which region is best?");
    }

    #[test]
    fn test_parse_args_rejects_bare_words() {
        assert!(parse_args(&["dataset".to_string()]).is_err());
    }

    #[test]
    fn test_session_file_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(".sluice/session.json");

        let session = InMemorySession::with_id("cli-test");
        session.set_last_dataset(PathBuf::from("/data/sales.csv"));
        save_session(&path, &session).unwrap();

        let loaded = load_session(&path).unwrap();
        assert_eq!(loaded.session_id(), "cli-test");
        assert_eq!(loaded.last_dataset(), Some(PathBuf::from("/data/sales.csv")));
    }
}
