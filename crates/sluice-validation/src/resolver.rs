//! Multi-layer resolution of "which file should this operation use"
//!
//! Layers run in order and stop at the first definitive answer:
//!
//! 1. **Parameter**: the caller's value, unless it is empty or a placeholder
//! 2. **State recovery**: the session's last-used dataset
//! 3. **Existence**: the candidate exists, or a bounded fuzzy search over the
//!    session workspace and the upload folders finds a unique best match
//! 4. **Readability**: a prefix of the file can be read
//! 5. **Format**: the caller's structural expectation holds

use crate::outcome::{InputKind, ValidationOutcome, ValidationStage};
use crate::tabular::{inspect_tabular, FormatProblem};
use serde_json::{json, Map, Value};
use sluice_core::{ResolverConfig, SessionContext, SluiceConfig, SubareaKind};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Values that orchestration loops pass when they mean "nothing"
const PLACEHOLDER_VALUES: &[&str] = &[
    "none",
    "null",
    "nil",
    "undefined",
    "n/a",
    "na",
    "path",
    "file",
    "filename",
    "dataset",
    "<path>",
    "<file>",
    "path/to/file",
    "path/to/file.csv",
];

/// Extensions considered when searching for a tabular input
const TABULAR_EXTENSIONS: &[&str] = &[
    "csv", "tsv", "txt", "dat", "parquet", "feather", "arrow", "xlsx", "xls",
];

/// Whether a supplied value is a real identifier rather than a placeholder
pub fn is_plausible_value(value: &str) -> bool {
    let trimmed = value.trim().trim_matches(|c| c == '"' || c == '\'');
    !trimmed.is_empty() && !PLACEHOLDER_VALUES.contains(&trimmed.to_lowercase().as_str())
}

struct Candidate {
    path: PathBuf,
    score: u8,
    modified: SystemTime,
}

/// Resolves file arguments for tool invocations
#[derive(Debug, Clone)]
pub struct InputResolver {
    upload_dirs: Vec<PathBuf>,
    prefix_bytes: usize,
    max_scan_entries: usize,
}

impl InputResolver {
    pub fn new(upload_dirs: Vec<PathBuf>, config: &ResolverConfig) -> Self {
        Self {
            upload_dirs,
            prefix_bytes: config.prefix_bytes.max(1),
            max_scan_entries: config.max_scan_entries,
        }
    }

    pub fn from_config(config: &SluiceConfig) -> Self {
        Self::new(config.workspace.upload_dirs.clone(), &config.resolver)
    }

    /// Resolve one file argument
    ///
    /// Never returns an error: every failure is a [`ValidationOutcome`] with
    /// the rejecting stage, a reason and a next step. A successful
    /// resolution is remembered as the session's last dataset.
    pub async fn resolve(
        &self,
        arg_name: &str,
        provided: Option<&str>,
        kind: InputKind,
        session: &dyn SessionContext,
    ) -> ValidationOutcome {
        // Parameter, then state recovery
        let (candidate, mut stage) = match provided.filter(|v| is_plausible_value(v)) {
            Some(value) => (Some(PathBuf::from(value.trim())), ValidationStage::Parameter),
            None => {
                if let Some(value) = provided {
                    debug!(arg = arg_name, value, "Ignoring placeholder argument value");
                }
                match session.last_dataset() {
                    Some(last) => (Some(last), ValidationStage::StateRecovery),
                    None => (None, ValidationStage::Existence),
                }
            }
        };

        let mut metadata = Map::new();

        // Existence
        let path = match candidate {
            Some(path) if fs::try_exists(&path).await.unwrap_or(false) => path,
            other => {
                let wanted = other.as_deref();
                match self.fuzzy_search(wanted, kind, session).await {
                    Ok(found) => {
                        info!(
                            arg = arg_name,
                            requested = ?wanted,
                            found = %found.display(),
                            "Resolved input by fuzzy search"
                        );
                        metadata.insert("fuzzy_match".into(), Value::Bool(true));
                        if let Some(wanted) = wanted {
                            metadata.insert("requested".into(), json!(wanted.display().to_string()));
                        }
                        stage = ValidationStage::Existence;
                        found
                    }
                    Err((reason, suggestion)) => {
                        warn!(arg = arg_name, requested = ?wanted, reason = %reason, "Input not found");
                        return ValidationOutcome::failure(
                            arg_name,
                            ValidationStage::Existence,
                            reason,
                            suggestion,
                        );
                    }
                }
            }
        };

        // Readability
        let prefix = match self.read_prefix(&path).await {
            Ok((prefix, size)) => {
                metadata.insert("size_bytes".into(), json!(size));
                prefix
            }
            Err((reason, suggestion)) => {
                warn!(arg = arg_name, path = %path.display(), reason = %reason, "Input unreadable");
                return ValidationOutcome::failure(
                    arg_name,
                    ValidationStage::Readability,
                    reason,
                    suggestion,
                );
            }
        };

        // Format
        if kind == InputKind::Tabular {
            let inspect_path = path.clone();
            let inspected = tokio::task::spawn_blocking(move || inspect_tabular(&inspect_path, &prefix))
                .await
                .unwrap_or_else(|e| {
                    Err(FormatProblem {
                        reason: format!("the file could not be inspected ({})", e),
                        suggestion: "try again, or try a smaller file".to_string(),
                    })
                });
            match inspected {
                Ok(summary) => {
                    if let Ok(Value::Object(fields)) = serde_json::to_value(&summary) {
                        metadata.extend(fields);
                    }
                }
                Err(problem) => {
                    warn!(arg = arg_name, path = %path.display(), reason = %problem.reason, "Input has wrong format");
                    return ValidationOutcome::failure(
                        arg_name,
                        ValidationStage::Format,
                        format!("{}: {}", path.display(), problem.reason),
                        problem.suggestion,
                    );
                }
            }
        }

        session.set_last_dataset(path.clone());
        debug!(arg = arg_name, path = %path.display(), stage = %stage, "Input resolved");
        ValidationOutcome::success(arg_name, stage, path, metadata)
    }

    /// Read up to `prefix_bytes` from the start of the file
    async fn read_prefix(&self, path: &Path) -> Result<(Vec<u8>, u64), (String, String)> {
        let metadata = fs::metadata(path).await.map_err(|e| unreadable(path, e))?;
        if metadata.is_dir() {
            return Err((
                format!("{} is a folder, not a file", path.display()),
                "specify a file inside the folder".to_string(),
            ));
        }
        if metadata.len() == 0 {
            return Err((
                format!("{} is empty", path.display()),
                "upload a file that contains data".to_string(),
            ));
        }

        let mut file = fs::File::open(path).await.map_err(|e| unreadable(path, e))?;
        let mut prefix = vec![0u8; self.prefix_bytes.min(metadata.len() as usize)];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = file
                .read(&mut prefix[filled..])
                .await
                .map_err(|e| unreadable(path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        prefix.truncate(filled);
        Ok((prefix, metadata.len()))
    }

    /// Best match for `wanted` (or, with nothing wanted, the most recent
    /// suitable file) among the session workspace and the upload folders
    async fn fuzzy_search(
        &self,
        wanted: Option<&Path>,
        kind: InputKind,
        session: &dyn SessionContext,
    ) -> Result<PathBuf, (String, String)> {
        let target = wanted
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_lowercase());

        let mut candidates = Vec::new();
        let mut scanned = 0usize;
        'dirs: for dir in self.search_dirs(session) {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                if scanned >= self.max_scan_entries {
                    debug!(limit = self.max_scan_entries, "Fuzzy search hit its scan limit");
                    break 'dirs;
                }
                scanned += 1;

                let name = entry.file_name().to_string_lossy().to_lowercase();
                if name.starts_with('.') || !kind_accepts(kind, &name) {
                    continue;
                }
                let score = match &target {
                    Some(target) => name_score(target, &name),
                    None => 1,
                };
                if score == 0 {
                    continue;
                }
                let metadata = match entry.metadata().await {
                    Ok(metadata) if metadata.is_file() => metadata,
                    _ => continue,
                };
                candidates.push(Candidate {
                    path: entry.path(),
                    score,
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }

        candidates.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| b.modified.cmp(&a.modified)));

        let mut ranked = candidates.into_iter();
        let best = match ranked.next() {
            Some(best) => best,
            None => {
                return Err(match wanted {
                    Some(wanted) => (
                        format!(
                            "{} does not exist and no similar file was found in the workspace or upload folders",
                            wanted.display()
                        ),
                        "check the file name, or upload the file again".to_string(),
                    ),
                    None => (
                        "no dataset found".to_string(),
                        "upload a file or specify one explicitly".to_string(),
                    ),
                })
            }
        };

        if let Some(runner_up) = ranked.next() {
            if runner_up.score == best.score && runner_up.modified == best.modified {
                return Err((
                    format!(
                        "several files match equally well ({}, {})",
                        best.path.display(),
                        runner_up.path.display()
                    ),
                    "specify the exact file you mean".to_string(),
                ));
            }
        }

        Ok(best.path)
    }

    fn search_dirs(&self, session: &dyn SessionContext) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(root) = session.workspace_root() {
            dirs.push(root.join(SubareaKind::Raw.dir_name()));
            dirs.push(root.join(SubareaKind::Derived.dir_name()));
        }
        dirs.extend(self.upload_dirs.iter().cloned());
        dirs
    }
}

fn unreadable(path: &Path, e: std::io::Error) -> (String, String) {
    let suggestion = match e.kind() {
        ErrorKind::PermissionDenied => "check the file permissions, or upload a copy of the file",
        ErrorKind::NotFound => "upload the file again",
        _ => "upload the file again, or try a smaller file",
    };
    (
        format!("{} could not be read: {}", path.display(), e),
        suggestion.to_string(),
    )
}

fn kind_accepts(kind: InputKind, file_name: &str) -> bool {
    match kind {
        InputKind::Any => true,
        InputKind::Tabular => Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| TABULAR_EXTENSIONS.contains(&e))
            .unwrap_or(false),
    }
}

fn stem(name: &str) -> &str {
    match name.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Name similarity, 0 (unrelated) to 3 (same file name); inputs lowercased
fn name_score(target: &str, candidate: &str) -> u8 {
    if candidate == target {
        return 3;
    }
    let (t, c) = (stem(target), stem(candidate));
    if t == c {
        2
    } else if t.len() >= 3 && c.len() >= 3 && (c.contains(t) || t.contains(c)) {
        1
    } else {
        0
    }
}
