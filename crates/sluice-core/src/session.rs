//! Typed per-conversation session context
//!
//! The pipeline only needs four pieces of session state: the bound workspace
//! root, the most recently used dataset, a stable session id, and a
//! cancellation handle. Orchestration loops implement [`SessionContext`] over
//! whatever store they use; [`InMemorySession`] is the default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Session state the pipeline reads and writes
pub trait SessionContext: Send + Sync {
    /// Stable identifier for this conversation
    fn session_id(&self) -> &str;

    /// Workspace generation bound to this session, if any
    fn workspace_root(&self) -> Option<PathBuf>;

    fn set_workspace_root(&self, root: PathBuf);

    /// Most recently uploaded or resolved dataset
    fn last_dataset(&self) -> Option<PathBuf>;

    fn set_last_dataset(&self, dataset: PathBuf);

    /// Token cancelled when the user aborts the conversation
    fn cancellation(&self) -> CancellationToken;
}

/// Serializable snapshot of a session, for persisting between processes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub last_dataset: Option<PathBuf>,
}

/// Mutex-backed session context
#[derive(Debug)]
pub struct InMemorySession {
    id: String,
    state: Mutex<SessionState>,
    cancellation: CancellationToken,
}

impl InMemorySession {
    /// Create a session with a fresh random id
    pub fn new() -> Self {
        Self::with_id(format!("session-{}", &uuid::Uuid::new_v4().to_string()[..8]))
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            state: Mutex::new(SessionState {
                session_id: id.clone(),
                ..SessionState::default()
            }),
            id,
            cancellation: CancellationToken::new(),
        }
    }

    /// Rehydrate a session from a persisted snapshot
    pub fn from_state(state: SessionState) -> Self {
        let session_id = if state.session_id.is_empty() {
            format!("session-{}", &uuid::Uuid::new_v4().to_string()[..8])
        } else {
            state.session_id.clone()
        };
        Self {
            id: session_id.clone(),
            state: Mutex::new(SessionState {
                session_id,
                ..state
            }),
            cancellation: CancellationToken::new(),
        }
    }

    /// Snapshot the current state
    pub fn to_state(&self) -> SessionState {
        self.lock().clone()
    }

    /// Abort everything this session has in flight
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext for InMemorySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn workspace_root(&self) -> Option<PathBuf> {
        self.lock().workspace_root.clone()
    }

    fn set_workspace_root(&self, root: PathBuf) {
        self.lock().workspace_root = Some(root);
    }

    fn last_dataset(&self) -> Option<PathBuf> {
        self.lock().last_dataset.clone()
    }

    fn set_last_dataset(&self, dataset: PathBuf) {
        self.lock().last_dataset = Some(dataset);
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}
