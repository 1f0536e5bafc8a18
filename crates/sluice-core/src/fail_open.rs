//! Fail-open utilities for graceful degradation
//!
//! For bookkeeping that must never fail the operation it accompanies:
//! activity logging and manifest self-healing.
//!
//! DO NOT use fail-open for:
//! - Artifact registration (the record is the product)
//! - Input resolution (a wrong file is worse than an error)
//! - Provider calls (failures drive the breaker)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use sluice_core::fail_open::fail_open;
/// use sluice_core::Result;
///
/// async fn append_activity() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let logged = fail_open("activity_log", || append_activity()).await;
///     // logged is None if append_activity() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    f().await
        .map_err(|e| warn!(operation = operation_name, error = %e, "Bookkeeping failed; continuing"))
        .ok()
}
