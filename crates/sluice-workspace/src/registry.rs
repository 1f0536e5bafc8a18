//! Versioned artifact registry for one workspace generation
//!
//! Registration relocates a produced file into its subarea, assigns the next
//! version for its logical name, and appends a record to the manifest.
//! Versions are never reused: re-registering a name always creates
//! `version + 1`, and a stored file is never overwritten.

use crate::manifest::{self, append_record, file_digest, read_manifest, versioned_file_name};
use crate::recovery::{self, RecoveryMode, RecoveryReport};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::fail_open::fail_open;
use sluice_core::{Result, SluiceError, SubareaKind};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Source tool recorded for artifacts reconstructed by a directory scan
pub const RECOVERED_SOURCE: &str = "recovered";

/// One registered version of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Logical name, e.g. `summary.json`
    pub name: String,
    /// Where the file is stored, inside a subarea of the workspace
    pub path: PathBuf,
    pub subarea: SubareaKind,
    /// Monotonic per name, starting at 0
    pub version: u32,
    pub registered_at: DateTime<Utc>,
    /// Tool or operation that produced the file
    pub source_tool: String,
    pub size_bytes: u64,
    /// SHA-256 hex digest of the stored content
    pub sha256: String,
}

/// Artifact registry bound to one [`Workspace`]
///
/// Version assignment is serialised per registry; share one registry per
/// workspace within a process.
#[derive(Debug)]
pub struct ArtifactRegistry {
    workspace: Workspace,
    index: Mutex<Vec<ArtifactRecord>>,
}

impl ArtifactRegistry {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            index: Mutex::new(Vec::new()),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Register `source` as the next version of `name`
    ///
    /// A file already sitting in the target subarea stays where it is,
    /// unless an earlier version is stored at that path, in which case the
    /// registration is refused rather than re-versioning the same bytes. A
    /// file elsewhere in the workspace (typically `tmp`) is moved; a file
    /// outside the workspace is copied, leaving the original untouched.
    pub async fn register(
        &self,
        name: &str,
        source: &Path,
        subarea: SubareaKind,
        source_tool: &str,
    ) -> Result<ArtifactRecord> {
        validate_name(name)?;
        let metadata = fs::metadata(source).await.map_err(|e| {
            SluiceError::Artifact(format!("Cannot register {}: {}", source.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(SluiceError::Artifact(format!(
                "Cannot register {}: not a regular file",
                source.display()
            )));
        }

        let mut index = self.index.lock().await;
        let known = self.known_records(&index).await;
        let mut version = next_version(&known, name);

        let target_dir = self.workspace.subarea(subarea);
        let source_canonical = fs::canonicalize(source).await?;
        let target_canonical = fs::canonicalize(&target_dir).await?;

        let stored_path = if source_canonical.parent() == Some(target_canonical.as_path()) {
            if let Some(owner) = owning_record(&known, &source_canonical).await {
                return Err(SluiceError::Artifact(format!(
                    "{} is already stored as {} v{}; write new output to a scratch path instead",
                    source.display(),
                    owner.name,
                    owner.version
                )));
            }
            debug!(artifact = %name, path = %source.display(), "Artifact already in place");
            source.to_path_buf()
        } else {
            let target = loop {
                let candidate = target_dir.join(versioned_file_name(name, version));
                if !fs::try_exists(&candidate).await? {
                    break candidate;
                }
                version += 1;
            };

            let root_canonical = fs::canonicalize(self.workspace.root_path()).await?;
            if source_canonical.starts_with(&root_canonical) {
                fs::rename(source, &target).await.map_err(|e| {
                    SluiceError::Artifact(format!(
                        "Failed to move {} into {}: {}",
                        source.display(),
                        subarea,
                        e
                    ))
                })?;
            } else {
                fs::copy(source, &target).await.map_err(|e| {
                    SluiceError::Artifact(format!(
                        "Failed to copy {} into {}: {}",
                        source.display(),
                        subarea,
                        e
                    ))
                })?;
            }
            target
        };

        let (size_bytes, sha256) = file_digest(&stored_path).await?;
        let record = ArtifactRecord {
            name: name.to_string(),
            path: stored_path,
            subarea,
            version,
            registered_at: Utc::now(),
            source_tool: source_tool.to_string(),
            size_bytes,
            sha256,
        };

        append_record(&self.workspace.manifest_path(), &record).await?;
        index.push(record.clone());

        info!(
            artifact = %record.name,
            version = record.version,
            subarea = %record.subarea,
            size_bytes = record.size_bytes,
            tool = %record.source_tool,
            "Registered artifact"
        );
        Ok(record)
    }

    /// Every known record, ordered by name then version
    pub async fn list(&self) -> Result<Vec<ArtifactRecord>> {
        let index = self.index.lock().await;
        Ok(self.known_records(&index).await)
    }

    /// All versions of `name`, oldest first
    pub async fn versions(&self, name: &str) -> Result<Vec<ArtifactRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.name == name)
            .collect())
    }

    /// Highest version of `name`
    pub async fn latest(&self, name: &str) -> Result<Option<ArtifactRecord>> {
        Ok(self.versions(name).await?.pop())
    }

    pub async fn get(&self, name: &str, version: u32) -> Result<Option<ArtifactRecord>> {
        Ok(self
            .versions(name)
            .await?
            .into_iter()
            .find(|r| r.version == version))
    }

    /// Rebuild the registry from the manifest and the files on disk
    ///
    /// Never fails. A readable manifest is verified against the disk (missing
    /// files dropped, untracked files adopted). An unreadable or corrupt
    /// manifest is moved aside and the registry is reconstructed from a
    /// directory scan. Whenever the result differs from the manifest, a fresh
    /// manifest is written (fail-open).
    pub async fn recover(&self) -> RecoveryReport {
        let mut index = self.index.lock().await;
        let manifest_path = self.workspace.manifest_path();
        let mut warnings = Vec::new();

        let (mode, records) = match read_manifest(&manifest_path).await {
            Ok(Some(contents)) if contents.bad_lines.is_empty() => {
                let records = self.reconcile(contents.records, &mut warnings).await;
                let mode = if warnings.is_empty() {
                    RecoveryMode::Manifest
                } else {
                    RecoveryMode::ManifestWithScan
                };
                (mode, records)
            }
            Ok(Some(contents)) => {
                warn!(
                    manifest = %manifest_path.display(),
                    bad_lines = ?contents.bad_lines,
                    "Artifact manifest is corrupt; rebuilding from directory scan"
                );
                warnings.push(format!(
                    "manifest had {} unreadable line(s); rebuilt from directory scan",
                    contents.bad_lines.len()
                ));
                if let Some(moved) =
                    fail_open("manifest quarantine", || manifest::quarantine(&manifest_path)).await
                {
                    warnings.push(format!("corrupt manifest kept at {}", moved.display()));
                }
                (RecoveryMode::DirectoryScan, self.rebuild(&mut warnings).await)
            }
            Ok(None) => {
                let records = self.rebuild(&mut warnings).await;
                if !records.is_empty() {
                    warnings.push(format!(
                        "no manifest found; {} artifact(s) reconstructed from directory scan",
                        records.len()
                    ));
                }
                (RecoveryMode::DirectoryScan, records)
            }
            Err(e) => {
                warn!(
                    manifest = %manifest_path.display(),
                    error = %e,
                    "Artifact manifest unreadable; rebuilding from directory scan"
                );
                warnings.push(format!("manifest unreadable ({}); rebuilt from directory scan", e));
                (RecoveryMode::DirectoryScan, self.rebuild(&mut warnings).await)
            }
        };

        if !warnings.is_empty() {
            fail_open("manifest rewrite", || {
                manifest::rewrite_manifest(&manifest_path, &records)
            })
            .await;
        }

        info!(
            workspace = %self.workspace.root_path().display(),
            mode = ?mode,
            records = records.len(),
            warnings = warnings.len(),
            "Artifact registry recovered"
        );

        *index = records.clone();
        RecoveryReport {
            records,
            warnings,
            mode,
        }
    }

    /// Verify manifest records against the disk and adopt untracked files
    async fn reconcile(
        &self,
        records: Vec<ArtifactRecord>,
        warnings: &mut Vec<String>,
    ) -> Vec<ArtifactRecord> {
        let mut kept = Vec::new();
        for record in merge(records, Vec::new()) {
            if fs::try_exists(&record.path).await.unwrap_or(false) {
                kept.push(record);
            } else {
                warnings.push(format!(
                    "{} v{} is recorded but missing at {}",
                    record.name,
                    record.version,
                    record.path.display()
                ));
            }
        }

        let tracked: HashSet<PathBuf> = kept.iter().map(|r| r.path.clone()).collect();
        let untracked: Vec<_> = recovery::scan_files(&self.workspace, warnings)
            .await
            .into_iter()
            .filter(|file| !tracked.contains(&file.path))
            .collect();

        for record in recovery::synthesize(untracked, &kept, warnings).await {
            warnings.push(format!(
                "adopted untracked file {} as {} v{}",
                record.path.display(),
                record.name,
                record.version
            ));
            kept.push(record);
        }

        merge(kept, Vec::new())
    }

    async fn rebuild(&self, warnings: &mut Vec<String>) -> Vec<ArtifactRecord> {
        let files = recovery::scan_files(&self.workspace, warnings).await;
        merge(recovery::synthesize(files, &[], warnings).await, Vec::new())
    }

    /// Manifest records (tolerantly parsed) merged with this process's index
    async fn known_records(&self, index: &[ArtifactRecord]) -> Vec<ArtifactRecord> {
        let from_manifest = match read_manifest(&self.workspace.manifest_path()).await {
            Ok(Some(contents)) => {
                if !contents.bad_lines.is_empty() {
                    warn!(
                        workspace = %self.workspace.root_path().display(),
                        bad_lines = ?contents.bad_lines,
                        "Skipping unreadable manifest lines; run recovery to repair"
                    );
                }
                contents.records
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Artifact manifest unreadable; using in-memory index");
                Vec::new()
            }
        };
        merge(from_manifest, index.to_vec())
    }
}

/// The record whose stored file is `path`, if any
async fn owning_record<'a>(known: &'a [ArtifactRecord], path: &Path) -> Option<&'a ArtifactRecord> {
    for record in known {
        if record.path.file_name() != path.file_name() {
            continue;
        }
        if let Ok(canonical) = fs::canonicalize(&record.path).await {
            if canonical == path {
                return Some(record);
            }
        }
    }
    None
}

/// Combine records keyed by (name, version)
///
/// Later `primary` entries replace earlier ones, so the last registration of
/// a duplicated key wins; `fallback` entries only fill gaps.
fn merge(primary: Vec<ArtifactRecord>, fallback: Vec<ArtifactRecord>) -> Vec<ArtifactRecord> {
    let mut by_key: BTreeMap<(String, u32), ArtifactRecord> = BTreeMap::new();
    for record in primary {
        by_key.insert((record.name.clone(), record.version), record);
    }
    for record in fallback {
        by_key
            .entry((record.name.clone(), record.version))
            .or_insert(record);
    }
    by_key.into_values().collect()
}

pub(crate) fn next_version(records: &[ArtifactRecord], name: &str) -> u32 {
    records
        .iter()
        .filter(|r| r.name == name)
        .map(|r| r.version + 1)
        .max()
        .unwrap_or(0)
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.trim().is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == "..";
    if invalid {
        return Err(SluiceError::Artifact(format!(
            "Invalid artifact name '{}': use a plain file name such as summary.json",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;
    use sluice_core::{GenerationPolicy, InMemorySession};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ArtifactRegistry) {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path().join("ws"), GenerationPolicy::NewPerSession);
        let workspace = manager.ensure("sales", &InMemorySession::new()).await.unwrap();
        (temp, ArtifactRegistry::new(workspace))
    }

    async fn write_tmp(registry: &ArtifactRegistry, file: &str, content: &str) -> PathBuf {
        let path = registry.workspace().subarea(SubareaKind::Tmp).join(file);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_versions_are_sequential_and_distinct() {
        let (_temp, registry) = setup().await;

        for i in 0..4 {
            let tmp = write_tmp(&registry, "out.json", &format!("{{\"run\": {}}}", i)).await;
            let record = registry
                .register("summary.json", &tmp, SubareaKind::Reports, "summarize")
                .await
                .unwrap();
            assert_eq!(record.version, i);
            assert!(!tmp.exists(), "tmp file should have been moved");
        }

        let versions = registry.versions("summary.json").await.unwrap();
        assert_eq!(versions.iter().map(|r| r.version).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let paths: HashSet<_> = versions.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths.len(), 4);
        assert!(versions[0].path.ends_with("reports/summary.json"));
        assert!(versions[3].path.ends_with("reports/summary.v3.json"));
        assert_eq!(
            tokio::fs::read_to_string(&versions[2].path).await.unwrap(),
            "{\"run\": 2}"
        );
    }

    #[tokio::test]
    async fn test_external_file_is_copied() {
        let (temp, registry) = setup().await;
        let outside = temp.path().join("upload.csv");
        tokio::fs::write(&outside, "a,b\n1,2\n").await.unwrap();

        let record = registry
            .register("upload.csv", &outside, SubareaKind::Raw, "upload")
            .await
            .unwrap();

        assert!(outside.exists());
        assert!(registry.workspace().contains(&record.path));
        assert_eq!(record.size_bytes, 8);
        assert_eq!(record.sha256.len(), 64);
    }

    #[tokio::test]
    async fn test_file_already_in_subarea_stays_put() {
        let (_temp, registry) = setup().await;
        let in_place = registry.workspace().subarea(SubareaKind::Plots).join("chart.png");
        tokio::fs::write(&in_place, b"png").await.unwrap();

        let record = registry
            .register("chart.png", &in_place, SubareaKind::Plots, "plot")
            .await
            .unwrap();

        assert_eq!(record.path, in_place);
        assert_eq!(record.version, 0);
    }

    #[tokio::test]
    async fn test_in_place_file_owned_by_a_record_is_refused() {
        let (_temp, registry) = setup().await;
        let in_place = registry.workspace().subarea(SubareaKind::Reports).join("summary.json");
        tokio::fs::write(&in_place, "first").await.unwrap();
        let first = registry
            .register("summary.json", &in_place, SubareaKind::Reports, "summarize")
            .await
            .unwrap();

        tokio::fs::write(&in_place, "second").await.unwrap();
        let second = registry
            .register("summary.json", &in_place, SubareaKind::Reports, "summarize")
            .await;

        assert!(matches!(second, Err(SluiceError::Artifact(_))));
        let versions = registry.versions("summary.json").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].sha256, first.sha256);
    }

    #[tokio::test]
    async fn test_versions_survive_restart() {
        let (_temp, registry) = setup().await;
        let tmp = write_tmp(&registry, "m.bin", "v0").await;
        registry
            .register("model.bin", &tmp, SubareaKind::Models, "train")
            .await
            .unwrap();

        // A new registry for the same workspace continues from the manifest
        let reopened = ArtifactRegistry::new(registry.workspace().clone());
        let tmp = write_tmp(&reopened, "m.bin", "v1").await;
        let record = reopened
            .register("model.bin", &tmp, SubareaKind::Models, "train")
            .await
            .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(reopened.latest("model.bin").await.unwrap().unwrap().version, 1);
        assert_eq!(reopened.get("model.bin", 0).await.unwrap().unwrap().source_tool, "train");
    }

    #[tokio::test]
    async fn test_never_overwrites_unrecorded_file() {
        let (_temp, registry) = setup().await;
        let squatter = registry.workspace().subarea(SubareaKind::Reports).join("summary.json");
        tokio::fs::write(&squatter, "older").await.unwrap();

        let tmp = write_tmp(&registry, "s.json", "newer").await;
        let record = registry
            .register("summary.json", &tmp, SubareaKind::Reports, "summarize")
            .await
            .unwrap();

        assert_eq!(record.version, 1);
        assert_eq!(tokio::fs::read_to_string(&squatter).await.unwrap(), "older");
    }

    #[tokio::test]
    async fn test_rejects_bad_names_and_missing_sources() {
        let (temp, registry) = setup().await;
        let file = temp.path().join("x.txt");
        tokio::fs::write(&file, "x").await.unwrap();

        let err = registry
            .register("../escape.txt", &file, SubareaKind::Reports, "t")
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::Artifact(_)));

        let err = registry
            .register("x.txt", &temp.path().join("missing.txt"), SubareaKind::Reports, "t")
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::Artifact(_)));
    }

    #[tokio::test]
    async fn test_concurrent_registrations_get_unique_versions() {
        let (_temp, registry) = setup().await;
        let registry = std::sync::Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let tmp = registry
                    .workspace()
                    .subarea(SubareaKind::Tmp)
                    .join(format!("part-{}.csv", i));
                tokio::fs::write(&tmp, format!("{}", i)).await.unwrap();
                registry
                    .register("part.csv", &tmp, SubareaKind::Derived, "split")
                    .await
                    .unwrap()
                    .version
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort();
        assert_eq!(versions, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_last_registration_wins() {
        let record = |tool: &str| ArtifactRecord {
            name: "a.txt".to_string(),
            path: PathBuf::from("/ws/reports/a.txt"),
            subarea: SubareaKind::Reports,
            version: 0,
            registered_at: Utc::now(),
            source_tool: tool.to_string(),
            size_bytes: 1,
            sha256: String::new(),
        };
        let merged = merge(vec![record("first"), record("second")], vec![record("index")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source_tool, "second");
    }
}
