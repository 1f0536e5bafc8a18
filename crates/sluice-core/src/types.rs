//! Shared value types used across the Sluice crates

use serde::{Deserialize, Serialize};

/// Fixed subareas every workspace generation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubareaKind {
    /// Uploaded or otherwise untouched input files
    Raw,
    /// Cleaned or transformed datasets
    Derived,
    Models,
    Reports,
    Plots,
    Metrics,
    Logs,
    /// Registry bookkeeping (artifact manifest)
    Manifests,
    /// Scratch space tools write into before registration
    Tmp,
}

impl SubareaKind {
    /// Every subarea, in creation order
    pub const ALL: [SubareaKind; 9] = [
        SubareaKind::Raw,
        SubareaKind::Derived,
        SubareaKind::Models,
        SubareaKind::Reports,
        SubareaKind::Plots,
        SubareaKind::Metrics,
        SubareaKind::Logs,
        SubareaKind::Manifests,
        SubareaKind::Tmp,
    ];

    /// Directory name of this subarea inside a workspace generation
    pub fn dir_name(&self) -> &'static str {
        match self {
            SubareaKind::Raw => "raw",
            SubareaKind::Derived => "derived",
            SubareaKind::Models => "models",
            SubareaKind::Reports => "reports",
            SubareaKind::Plots => "plots",
            SubareaKind::Metrics => "metrics",
            SubareaKind::Logs => "logs",
            SubareaKind::Manifests => "manifests",
            SubareaKind::Tmp => "tmp",
        }
    }

    /// Subareas whose files are user-facing artifacts (scanned on recovery)
    pub fn holds_artifacts(&self) -> bool {
        !matches!(self, SubareaKind::Manifests | SubareaKind::Tmp)
    }
}

impl std::fmt::Display for SubareaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for SubareaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubareaKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.dir_name() == s.to_lowercase())
            .ok_or_else(|| {
                format!(
                    "Invalid subarea: {}. Use one of raw, derived, models, reports, plots, metrics, logs, manifests, tmp.",
                    s
                )
            })
    }
}
