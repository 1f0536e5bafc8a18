//! Per-dataset workspace generations
//!
//! Layout: `<root>/<dataset>/<generation>/<subarea>/`. A generation directory
//! name encodes its creation time with microsecond precision
//! (`20250114-093012-123456`); a numeric suffix is appended when two
//! generations are created within the same microsecond.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::{GenerationPolicy, Result, SessionContext, SluiceError, SubareaKind, WorkspaceConfig};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Placeholder used when a dataset name sanitises to nothing
pub const PLACEHOLDER_DATASET: &str = "dataset";

/// File inside the `logs` subarea that receives invocation records
pub const ACTIVITY_LOG_FILE: &str = "activity.jsonl";

/// File inside the `manifests` subarea holding artifact records
pub const MANIFEST_FILE: &str = "artifacts.jsonl";

const GENERATION_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";
/// Length of a formatted generation timestamp, without collision suffix
const GENERATION_STAMP_LEN: usize = 22;

/// Reduce a dataset name to `[A-Za-z0-9_-]`
///
/// A trailing file extension is dropped first, so `sales.csv` and `sales`
/// share a workspace.
pub fn sanitize_dataset_name(name: &str) -> String {
    let trimmed = name.trim();
    let base = Path::new(trimmed)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(trimmed);
    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => base,
    };

    let sanitized: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    if sanitized.is_empty() {
        PLACEHOLDER_DATASET.to_string()
    } else {
        sanitized
    }
}

fn parse_generation(dir_name: &str) -> Option<DateTime<Utc>> {
    let stamp = dir_name.get(..GENERATION_STAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, GENERATION_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// One generation of a dataset's isolated directory tree
///
/// Every subarea directory exists once a `Workspace` value has been built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    root_path: PathBuf,
    dataset_name: String,
    generation: DateTime<Utc>,
    subareas: BTreeMap<SubareaKind, PathBuf>,
}

impl Workspace {
    /// Attach to an existing generation directory, re-creating any missing
    /// subareas
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root_path = path.as_ref().to_path_buf();
        let generation_dir = root_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid_generation(&root_path))?;
        let generation = parse_generation(generation_dir).ok_or_else(|| invalid_generation(&root_path))?;
        let dataset_name = root_path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| invalid_generation(&root_path))?;

        Self::materialize(root_path, dataset_name, generation).await
    }

    async fn materialize(
        root_path: PathBuf,
        dataset_name: String,
        generation: DateTime<Utc>,
    ) -> Result<Self> {
        let mut subareas = BTreeMap::new();
        for kind in SubareaKind::ALL {
            let dir = root_path.join(kind.dir_name());
            fs::create_dir_all(&dir).await.map_err(|e| {
                SluiceError::Workspace(format!(
                    "Failed to create subarea {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            subareas.insert(kind, dir);
        }

        Ok(Self {
            root_path,
            dataset_name,
            generation,
            subareas,
        })
    }

    /// The generation directory
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn generation(&self) -> DateTime<Utc> {
        self.generation
    }

    /// Directory name of this generation
    pub fn generation_id(&self) -> &str {
        self.root_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn subarea(&self, kind: SubareaKind) -> PathBuf {
        self.subareas
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.root_path.join(kind.dir_name()))
    }

    pub fn subareas(&self) -> &BTreeMap<SubareaKind, PathBuf> {
        &self.subareas
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.subarea(SubareaKind::Manifests).join(MANIFEST_FILE)
    }

    pub fn activity_log_path(&self) -> PathBuf {
        self.subarea(SubareaKind::Logs).join(ACTIVITY_LOG_FILE)
    }

    /// Whether `path` lies inside this generation
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root_path)
    }

    /// The subarea directly holding `path`, if any
    pub fn subarea_of(&self, path: &Path) -> Option<SubareaKind> {
        let parent = path.parent()?;
        self.subareas
            .iter()
            .find(|(_, dir)| dir.as_path() == parent)
            .map(|(kind, _)| *kind)
    }
}

fn invalid_generation(path: &Path) -> SluiceError {
    SluiceError::Workspace(format!(
        "{} is not a workspace generation (expected <root>/<dataset>/<timestamp>)",
        path.display()
    ))
}

/// Creates and re-attaches workspace generations under one root
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    policy: GenerationPolicy,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, policy: GenerationPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self::new(config.root.clone(), config.generation_policy)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> GenerationPolicy {
        self.policy
    }

    /// Return the session's workspace for `dataset_name`, creating it on
    /// first use
    ///
    /// Safe to call on every invocation: once the session is bound to a
    /// generation of this dataset, the same generation is returned (its
    /// subareas re-created if something removed them). A session bound to a
    /// different dataset is re-bound according to the generation policy.
    pub async fn ensure(&self, dataset_name: &str, session: &dyn SessionContext) -> Result<Workspace> {
        let dataset = sanitize_dataset_name(dataset_name);
        let dataset_dir = self.root.join(&dataset);

        if let Some(bound) = session.workspace_root() {
            if bound.parent() == Some(dataset_dir.as_path()) {
                let workspace = Workspace::open(&bound).await?;
                debug!(
                    session = session.session_id(),
                    workspace = %workspace.root_path().display(),
                    "Reusing session workspace"
                );
                return Ok(workspace);
            }
            debug!(
                session = session.session_id(),
                bound = %bound.display(),
                dataset = %dataset,
                "Session workspace belongs to another dataset; re-binding"
            );
        }

        let workspace = match self.policy {
            GenerationPolicy::ReuseLatest => match self.latest_generation(&dataset).await? {
                Some(existing) => {
                    info!(
                        session = session.session_id(),
                        workspace = %existing.root_path().display(),
                        "Attached session to latest workspace generation"
                    );
                    existing
                }
                None => self.create_generation(&dataset).await?,
            },
            GenerationPolicy::NewPerSession => self.create_generation(&dataset).await?,
        };

        session.set_workspace_root(workspace.root_path().to_path_buf());
        Ok(workspace)
    }

    /// Create a fresh generation for an already-sanitised dataset name
    pub async fn create_generation(&self, dataset: &str) -> Result<Workspace> {
        let dataset_dir = self.root.join(dataset);
        fs::create_dir_all(&dataset_dir).await.map_err(|e| {
            SluiceError::Workspace(format!(
                "Failed to create dataset directory {}: {}",
                dataset_dir.display(),
                e
            ))
        })?;

        let stamp = Utc::now().format(GENERATION_FORMAT).to_string();
        let generation = parse_generation(&stamp).unwrap_or_else(Utc::now);

        let mut suffix = 0u32;
        let root_path = loop {
            let name = if suffix == 0 {
                stamp.clone()
            } else {
                format!("{}-{}", stamp, suffix)
            };
            let candidate = dataset_dir.join(name);
            match fs::create_dir(&candidate).await {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => {
                    return Err(SluiceError::Workspace(format!(
                        "Failed to create workspace {}: {}",
                        candidate.display(),
                        e
                    )))
                }
            }
        };

        let workspace = Workspace::materialize(root_path, dataset.to_string(), generation).await?;
        info!(
            dataset = %dataset,
            workspace = %workspace.root_path().display(),
            "Created workspace generation"
        );
        Ok(workspace)
    }

    /// Every generation of a dataset, newest first
    pub async fn list_generations(&self, dataset_name: &str) -> Result<Vec<Workspace>> {
        let dataset_dir = self.root.join(sanitize_dataset_name(dataset_name));
        let mut entries = match fs::read_dir(&dataset_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(generation) = parse_generation(&name) {
                found.push((generation, name, entry.path()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let mut generations = Vec::with_capacity(found.len());
        for (_, _, path) in found {
            generations.push(Workspace::open(path).await?);
        }
        Ok(generations)
    }

    async fn latest_generation(&self, dataset: &str) -> Result<Option<Workspace>> {
        Ok(self.list_generations(dataset).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::InMemorySession;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_dataset_name() {
        assert_eq!(sanitize_dataset_name("sales.csv"), "sales");
        assert_eq!(sanitize_dataset_name("Q3 sales (final).xlsx"), "Q3salesfinal");
        assert_eq!(sanitize_dataset_name("uploads/raw_data-v2.parquet"), "raw_data-v2");
        assert_eq!(sanitize_dataset_name("../../etc"), "etc");
        assert_eq!(sanitize_dataset_name("???"), PLACEHOLDER_DATASET);
        assert_eq!(sanitize_dataset_name(""), PLACEHOLDER_DATASET);
        assert_eq!(sanitize_dataset_name(".hidden"), "hidden");
    }

    #[test]
    fn test_generation_stamp_round_trips() {
        let parsed = parse_generation("20250114-093012-123456").unwrap();
        assert_eq!(parsed.format(GENERATION_FORMAT).to_string(), "20250114-093012-123456");
        assert!(parse_generation("20250114-093012-123456-2").is_some());
        assert!(parse_generation("not-a-generation").is_none());
    }

    #[tokio::test]
    async fn test_ensure_creates_all_subareas() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path(), GenerationPolicy::NewPerSession);
        let session = InMemorySession::new();

        let ws = manager.ensure("sales.csv", &session).await.unwrap();

        assert_eq!(ws.dataset_name(), "sales");
        assert_eq!(ws.root_path().parent().unwrap(), temp.path().join("sales"));
        for kind in SubareaKind::ALL {
            assert!(ws.subarea(kind).is_dir(), "missing {}", kind);
        }
        assert_eq!(session.workspace_root().as_deref(), Some(ws.root_path()));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_per_session() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path(), GenerationPolicy::NewPerSession);
        let session = InMemorySession::new();

        let first = manager.ensure("sales", &session).await.unwrap();
        let second = manager.ensure("sales", &session).await.unwrap();

        assert_eq!(first.root_path(), second.root_path());
        assert_eq!(manager.list_generations("sales").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_separate_sessions_get_separate_generations() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path(), GenerationPolicy::NewPerSession);

        let a = manager.ensure("sales", &InMemorySession::new()).await.unwrap();
        let b = manager.ensure("sales", &InMemorySession::new()).await.unwrap();

        assert_ne!(a.root_path(), b.root_path());
        let generations = manager.list_generations("sales").await.unwrap();
        assert_eq!(generations.len(), 2);
        // Newest first
        assert_eq!(generations[0].root_path(), b.root_path());
    }

    #[tokio::test]
    async fn test_reuse_latest_attaches_new_session() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path(), GenerationPolicy::ReuseLatest);

        let a = manager.ensure("sales", &InMemorySession::new()).await.unwrap();
        let b = manager.ensure("sales", &InMemorySession::new()).await.unwrap();

        assert_eq!(a.root_path(), b.root_path());
    }

    #[tokio::test]
    async fn test_session_rebinds_on_dataset_change() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path(), GenerationPolicy::NewPerSession);
        let session = InMemorySession::new();

        let sales = manager.ensure("sales", &session).await.unwrap();
        let churn = manager.ensure("churn", &session).await.unwrap();

        assert_ne!(sales.root_path(), churn.root_path());
        assert_eq!(session.workspace_root().as_deref(), Some(churn.root_path()));
    }

    #[tokio::test]
    async fn test_ensure_restores_deleted_subareas() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path(), GenerationPolicy::NewPerSession);
        let session = InMemorySession::new();

        let ws = manager.ensure("sales", &session).await.unwrap();
        std::fs::remove_dir_all(ws.subarea(SubareaKind::Plots)).unwrap();

        let again = manager.ensure("sales", &session).await.unwrap();
        assert_eq!(again.root_path(), ws.root_path());
        assert!(again.subarea(SubareaKind::Plots).is_dir());
    }

    #[tokio::test]
    async fn test_open_rejects_non_generation_dir() {
        let temp = TempDir::new().unwrap();
        let result = Workspace::open(temp.path().join("sales").join("scratch")).await;
        assert!(matches!(result, Err(SluiceError::Workspace(_))));
    }

    #[tokio::test]
    async fn test_subarea_of() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path(), GenerationPolicy::NewPerSession);
        let ws = manager.ensure("sales", &InMemorySession::new()).await.unwrap();

        let report = ws.subarea(SubareaKind::Reports).join("summary.json");
        assert_eq!(ws.subarea_of(&report), Some(SubareaKind::Reports));
        assert!(ws.contains(&report));
        assert_eq!(ws.subarea_of(&temp.path().join("elsewhere.txt")), None);
    }
}
