//! # sluice-workspace
//!
//! Isolated, versioned storage for the files a session works with.
//!
//! A [`Workspace`] is one generation of a dataset's directory tree
//! (`<root>/<dataset>/<generation>/`) with fixed subareas. The
//! [`ArtifactRegistry`] records every file produced into a workspace under a
//! monotonic per-name version, persists the records to a JSON Lines manifest,
//! and can rebuild itself from the directory tree when the manifest is lost
//! or damaged.

mod manifest;
mod recovery;
mod registry;
mod workspace;

pub use manifest::{split_versioned, versioned_file_name};
pub use recovery::{RecoveryMode, RecoveryReport};
pub use registry::{ArtifactRecord, ArtifactRegistry, RECOVERED_SOURCE};
pub use workspace::{
    sanitize_dataset_name, Workspace, WorkspaceManager, ACTIVITY_LOG_FILE, MANIFEST_FILE,
    PLACEHOLDER_DATASET,
};
