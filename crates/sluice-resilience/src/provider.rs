//! The seam between the router and a concrete completion backend

use crate::types::{CompletionRequest, CompletionResponse};
use async_trait::async_trait;
use sluice_core::ProviderError;

/// A completion backend the router can call
///
/// Implementations classify their own failures into
/// [`ProviderErrorKind`](sluice_core::ProviderErrorKind) and attach any retry
/// hint the backend gave. They must not retry internally; retrying, breaker
/// bookkeeping and fallback all happen above this trait.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Name used for breakers, logs and fallback reports
    fn name(&self) -> &str;

    /// Model identifier sent with every request
    fn model(&self) -> &str;

    /// Send a single request, with no retries
    async fn send(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}
