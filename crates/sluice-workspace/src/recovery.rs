//! Best-effort reconstruction of artifact records from the files on disk

use crate::manifest::{file_digest, split_versioned};
use crate::registry::{next_version, ArtifactRecord, RECOVERED_SOURCE};
use crate::workspace::{Workspace, ACTIVITY_LOG_FILE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sluice_core::SubareaKind;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::fs;
use tracing::warn;

/// Where recovered records came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// The manifest matched the disk exactly
    Manifest,
    /// The manifest was readable but had to be reconciled with the disk
    ManifestWithScan,
    /// The manifest was missing or corrupt; records were inferred from files
    DirectoryScan,
}

/// Outcome of [`ArtifactRegistry::recover`](crate::ArtifactRegistry::recover)
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub records: Vec<ArtifactRecord>,
    /// Everything that was guessed, dropped or repaired
    pub warnings: Vec<String>,
    pub mode: RecoveryMode,
}

impl RecoveryReport {
    /// True when nothing had to be inferred or discarded
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// A file found in an artifact-holding subarea
#[derive(Debug, Clone)]
pub(crate) struct ScannedFile {
    pub path: PathBuf,
    pub subarea: SubareaKind,
    pub logical_name: String,
    pub suffix_version: Option<u32>,
    pub modified: SystemTime,
}

pub(crate) async fn scan_files(workspace: &Workspace, warnings: &mut Vec<String>) -> Vec<ScannedFile> {
    let mut files = Vec::new();

    for kind in SubareaKind::ALL.into_iter().filter(|k| k.holds_artifacts()) {
        let dir = workspace.subarea(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(subarea = %kind, error = %e, "Cannot scan subarea");
                warnings.push(format!("could not scan {}: {}", kind, e));
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warnings.push(format!("scan of {} stopped early: {}", kind, e));
                    break;
                }
            };

            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') || (kind == SubareaKind::Logs && file_name == ACTIVITY_LOG_FILE) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warnings.push(format!("skipped {}: {}", entry.path().display(), e));
                    continue;
                }
            };

            let (logical_name, suffix_version) = split_versioned(&file_name);
            files.push(ScannedFile {
                path: entry.path(),
                subarea: kind,
                logical_name,
                suffix_version,
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    files
}

/// Turn scanned files into records, ordering each name's versions by
/// modification time and continuing after any versions in `existing`
pub(crate) async fn synthesize(
    files: Vec<ScannedFile>,
    existing: &[ArtifactRecord],
    warnings: &mut Vec<String>,
) -> Vec<ArtifactRecord> {
    let mut groups: BTreeMap<String, Vec<ScannedFile>> = BTreeMap::new();
    for file in files {
        groups.entry(file.logical_name.clone()).or_default().push(file);
    }

    let mut records = Vec::new();
    for (name, mut group) in groups {
        group.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.suffix_version.cmp(&b.suffix_version))
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut version = next_version(existing, &name);
        for file in group {
            let (size_bytes, sha256) = match file_digest(&file.path).await {
                Ok(digest) => digest,
                Err(e) => {
                    warnings.push(format!("skipped unreadable {}: {}", file.path.display(), e));
                    continue;
                }
            };
            records.push(ArtifactRecord {
                name: name.clone(),
                path: file.path,
                subarea: file.subarea,
                version,
                registered_at: DateTime::<Utc>::from(file.modified),
                source_tool: RECOVERED_SOURCE.to_string(),
                size_bytes,
                sha256,
            });
            version += 1;
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ArtifactRegistry;
    use crate::workspace::WorkspaceManager;
    use sluice_core::{GenerationPolicy, InMemorySession};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn workspace(temp: &TempDir) -> Workspace {
        WorkspaceManager::new(temp.path(), GenerationPolicy::NewPerSession)
            .ensure("sales", &InMemorySession::new())
            .await
            .unwrap()
    }

    fn set_mtime(path: &std::path::Path, secs_after_epoch: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    async fn register_tmp(registry: &ArtifactRegistry, name: &str, subarea: SubareaKind, body: &str) {
        let tmp = registry.workspace().subarea(SubareaKind::Tmp).join("staging");
        tokio::fs::write(&tmp, body).await.unwrap();
        registry.register(name, &tmp, subarea, "tool").await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_manifest_recovers_completely() {
        let temp = TempDir::new().unwrap();
        let registry = ArtifactRegistry::new(workspace(&temp).await);
        register_tmp(&registry, "summary.json", SubareaKind::Reports, "{}").await;
        register_tmp(&registry, "summary.json", SubareaKind::Reports, "{\"a\":1}").await;

        let fresh = ArtifactRegistry::new(registry.workspace().clone());
        let report = fresh.recover().await;

        assert_eq!(report.mode, RecoveryMode::Manifest);
        assert!(report.is_complete());
        assert_eq!(report.records.len(), 2);
        assert_eq!(fresh.latest("summary.json").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_degrades_to_scan() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp).await;
        let reports = ws.subarea(SubareaKind::Reports);
        std::fs::write(reports.join("summary.json"), "first").unwrap();
        std::fs::write(reports.join("summary.v1.json"), "second").unwrap();
        std::fs::write(ws.subarea(SubareaKind::Models).join("model.bin"), "weights").unwrap();
        set_mtime(&reports.join("summary.json"), 1_000);
        set_mtime(&reports.join("summary.v1.json"), 2_000);
        std::fs::write(ws.manifest_path(), "{\"name\": \"summary.json\", trunc").unwrap();

        let registry = ArtifactRegistry::new(ws.clone());
        let report = registry.recover().await;

        assert_eq!(report.mode, RecoveryMode::DirectoryScan);
        assert!(!report.is_complete());
        assert_eq!(report.records.len(), 3);

        let summary = registry.versions("summary.json").await.unwrap();
        assert_eq!(summary.len(), 2);
        assert!(summary[0].path.ends_with("summary.json"));
        assert!(summary[1].path.ends_with("summary.v1.json"));
        assert_eq!(summary[1].source_tool, RECOVERED_SOURCE);

        // The corrupt manifest was kept aside and a clean one written
        let quarantined = std::fs::read_dir(ws.subarea(SubareaKind::Manifests))
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(quarantined);
        let rewritten = std::fs::read_to_string(ws.manifest_path()).unwrap();
        assert_eq!(rewritten.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_scan_orders_versions_by_mtime() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp).await;
        let plots = ws.subarea(SubareaKind::Plots);
        // Suffixes disagree with modification times; mtime decides
        std::fs::write(plots.join("chart.png"), "newest").unwrap();
        std::fs::write(plots.join("chart.v5.png"), "oldest").unwrap();
        set_mtime(&plots.join("chart.png"), 5_000);
        set_mtime(&plots.join("chart.v5.png"), 1_000);

        let report = ArtifactRegistry::new(ws).recover().await;
        let charts: Vec<_> = report.records.iter().filter(|r| r.name == "chart.png").collect();
        assert_eq!(charts.len(), 2);
        assert!(charts[0].path.ends_with("chart.v5.png"));
        assert_eq!(charts[0].version, 0);
        assert_eq!(charts[1].version, 1);
    }

    #[tokio::test]
    async fn test_untracked_and_missing_files_are_reconciled() {
        let temp = TempDir::new().unwrap();
        let registry = ArtifactRegistry::new(workspace(&temp).await);
        register_tmp(&registry, "a.csv", SubareaKind::Derived, "1").await;
        register_tmp(&registry, "b.csv", SubareaKind::Derived, "2").await;

        let derived = registry.workspace().subarea(SubareaKind::Derived);
        std::fs::remove_file(derived.join("b.csv")).unwrap();
        std::fs::write(derived.join("a.v1.csv"), "dropped in by hand").unwrap();

        let report = registry.recover().await;

        assert_eq!(report.mode, RecoveryMode::ManifestWithScan);
        assert_eq!(report.warnings.len(), 2);
        let names: Vec<_> = report
            .records
            .iter()
            .map(|r| (r.name.as_str(), r.version))
            .collect();
        assert_eq!(names, vec![("a.csv", 0), ("a.csv", 1)]);
    }

    #[tokio::test]
    async fn test_activity_log_and_tmp_are_not_artifacts() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp).await;
        std::fs::write(ws.activity_log_path(), "{}\n").unwrap();
        std::fs::write(ws.subarea(SubareaKind::Tmp).join("scratch.csv"), "x").unwrap();

        let report = ArtifactRegistry::new(ws).recover().await;
        assert!(report.records.is_empty());
        assert!(report.is_complete());
        assert_eq!(report.mode, RecoveryMode::DirectoryScan);
    }
}
