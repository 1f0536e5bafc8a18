//! Artifact manifest persistence and stored-file naming
//!
//! The manifest is JSON Lines, one [`ArtifactRecord`] per line, appended on
//! every registration. It is the source of truth across process restarts.

use crate::registry::ArtifactRecord;
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use sluice_core::{Result, SluiceError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// File name used to store `version` of the logical artifact `name`
///
/// Version 0 keeps the logical name; later versions insert `.v<N>` before
/// the extension (`summary.json` → `summary.v2.json`, `model` → `model.v2`).
pub fn versioned_file_name(name: &str, version: u32) -> String {
    if version == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.v{}.{}", stem, version, ext),
        _ => format!("{}.v{}", name, version),
    }
}

fn version_suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+)\.v(\d+)(\.[^.]+)?$").expect("version suffix pattern is valid")
    })
}

/// Split a stored file name into its logical name and version suffix
pub fn split_versioned(file_name: &str) -> (String, Option<u32>) {
    if let Some(caps) = version_suffix_regex().captures(file_name) {
        if let Ok(version) = caps[2].parse::<u32>() {
            let ext = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            return (format!("{}{}", &caps[1], ext), Some(version));
        }
    }
    (file_name.to_string(), None)
}

/// Parsed manifest, with the 1-based numbers of lines that failed to parse
#[derive(Debug, Default)]
pub(crate) struct ManifestContents {
    pub records: Vec<ArtifactRecord>,
    pub bad_lines: Vec<usize>,
}

/// Read the manifest; `None` if it does not exist yet
pub(crate) async fn read_manifest(path: &Path) -> Result<Option<ManifestContents>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut contents = ManifestContents::default();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ArtifactRecord>(line) {
            Ok(record) => contents.records.push(record),
            Err(_) => contents.bad_lines.push(index + 1),
        }
    }
    Ok(Some(contents))
}

pub(crate) async fn append_record(path: &Path, record: &ArtifactRecord) -> Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| {
            SluiceError::Artifact(format!("Failed to open manifest {}: {}", path.display(), e))
        })?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Replace the manifest with `records`, atomically
pub(crate) async fn rewrite_manifest(path: &Path, records: &[ArtifactRecord]) -> Result<()> {
    let mut content = String::new();
    for record in records {
        content.push_str(&serde_json::to_string(record)?);
        content.push('\n');
    }

    let tmp = path.with_extension("jsonl.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Move a corrupt manifest aside so it can be inspected later
pub(crate) async fn quarantine(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let target = path.with_file_name(format!(
        "{}.corrupt-{}",
        file_name,
        Utc::now().format("%Y%m%d-%H%M%S")
    ));
    fs::rename(path, &target).await?;
    Ok(target)
}

/// Size in bytes and SHA-256 hex digest of a file
pub(crate) async fn file_digest(path: &Path) -> Result<(u64, String)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(u64, String)> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let size = std::io::copy(&mut file, &mut hasher)?;
        Ok((size, hex::encode(hasher.finalize())))
    })
    .await
    .map_err(|e| SluiceError::Other(format!("Digest task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_versioned_file_name() {
        assert_eq!(versioned_file_name("summary.json", 0), "summary.json");
        assert_eq!(versioned_file_name("summary.json", 3), "summary.v3.json");
        assert_eq!(versioned_file_name("model", 1), "model.v1");
        assert_eq!(versioned_file_name("data.tar.gz", 2), "data.tar.v2.gz");
        assert_eq!(versioned_file_name(".env", 1), ".env.v1");
    }

    #[test]
    fn test_split_versioned() {
        assert_eq!(split_versioned("summary.v3.json"), ("summary.json".to_string(), Some(3)));
        assert_eq!(split_versioned("model.v1"), ("model".to_string(), Some(1)));
        assert_eq!(split_versioned("data.tar.v2.gz"), ("data.tar.gz".to_string(), Some(2)));
        assert_eq!(split_versioned("summary.json"), ("summary.json".to_string(), None));
        assert_eq!(split_versioned("release.vx.json"), ("release.vx.json".to_string(), None));
    }

    #[tokio::test]
    async fn test_read_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let read = read_manifest(&temp.path().join("artifacts.jsonl")).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_bad_lines_are_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("artifacts.jsonl");
        tokio::fs::write(&path, "{not json\n\n").await.unwrap();

        let read = read_manifest(&path).await.unwrap().unwrap();
        assert!(read.records.is_empty());
        assert_eq!(read.bad_lines, vec![1]);
    }

    #[tokio::test]
    async fn test_file_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hello.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let (size, digest) = file_digest(&path).await.unwrap();
        assert_eq!(size, 5);
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_quarantine_moves_file_aside() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("artifacts.jsonl");
        tokio::fs::write(&path, "garbage").await.unwrap();

        let moved = quarantine(&path).await.unwrap();
        assert!(!path.exists());
        assert!(moved.exists());
        assert!(moved
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("artifacts.jsonl.corrupt-"));
    }
}
