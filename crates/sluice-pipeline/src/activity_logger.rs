//! Activity Logger - one JSON line per invocation in `logs/activity.jsonl`
//!
//! Gives an auditable trail of what ran inside a workspace:
//! - Tool name, session and duration
//! - Outcome, with the failing stage and reason
//! - Artifacts registered (`name@vN`) and the resolved input paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::fail_open::fail_open;
use sluice_core::{Result, SubareaKind};
use sluice_workspace::ACTIVITY_LOG_FILE;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Maximum characters of a failure reason kept in the log
const REASON_PREVIEW_CHARS: usize = 500;

/// One logged invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub session: String,
    pub tool: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PathBuf>,
}

/// Activity logger for one workspace generation
pub struct ActivityLogger {
    output_path: PathBuf,
}

impl ActivityLogger {
    /// Logger writing into the `logs` subarea of the workspace at `root`
    pub fn for_workspace(root: &Path) -> Self {
        Self {
            output_path: root.join(SubareaKind::Logs.dir_name()).join(ACTIVITY_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.output_path
    }

    /// Append an entry
    ///
    /// This operation is fail-open - logging failures won't fail the invocation
    pub async fn record(&self, entry: &ActivityEntry) {
        fail_open("activity_logger::record", || async {
            let mut entry = entry.clone();
            if let Some(reason) = &entry.reason {
                if reason.chars().count() > REASON_PREVIEW_CHARS {
                    let truncated: String = reason.chars().take(REASON_PREVIEW_CHARS).collect();
                    entry.reason = Some(format!("{truncated}..."));
                }
            }
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            self.append_internal(&line).await
        })
        .await;
    }

    /// Every parseable entry, oldest first; unparseable lines are skipped
    pub async fn read_entries(&self) -> Result<Vec<ActivityEntry>> {
        let content = match tokio::fs::read_to_string(&self.output_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Append content to the activity log (internal, returns Result for fail_open)
    async fn append_internal(&self, content: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;

        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }
}
