//! Unified error types for Sluice

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classified failure kind reported by a remote provider client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Quota or request-rate exceeded (HTTP 429 and friends)
    RateLimited,
    /// Provider temporarily unable to serve (5xx, overloaded, transport)
    Unavailable,
    /// The request itself was rejected and will never succeed as-is
    Malformed,
    /// Anything the client could not classify
    Other,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Malformed => write!(f, "malformed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Error raised by a remote provider client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error from provider: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// HTTP-equivalent status, when the transport has one
    pub status: Option<u16>,
    /// Provider-supplied "retry after" hint
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Malformed, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Why a single provider could not serve a routed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
    /// How long until this provider may be tried again, if known
    pub retry_in: Option<Duration>,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

fn summarize_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Unified error type for all Sluice operations
#[derive(Error, Debug)]
pub enum SluiceError {
    // Provider errors
    #[error("Circuit breaker for provider '{provider}' is open; retry in {}s", .retry_in.as_secs())]
    CircuitOpen { provider: String, retry_in: Duration },

    #[error("Provider '{provider}' failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        provider: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Provider '{provider}' rejected the request: {source}")]
    Permanent {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("All providers failed: {}", summarize_failures(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),

    #[error("No providers configured")]
    NoProviders,

    // Workspace errors
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl SluiceError {
    /// Whether a caller could reasonably retry the same operation later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RetriesExhausted { .. } | Self::AllProvidersFailed(_)
        )
    }

    /// Shortest known wait before a retry has a chance of succeeding
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            Self::RetriesExhausted { source, .. } => source.retry_after,
            Self::AllProvidersFailed(failures) => failures.iter().filter_map(|f| f.retry_in).min(),
            _ => None,
        }
    }
}

/// Result type alias using SluiceError
pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_providers_failed_lists_every_reason() {
        let err = SluiceError::AllProvidersFailed(vec![
            ProviderFailure {
                provider: "primary".to_string(),
                reason: "circuit open".to_string(),
                retry_in: Some(Duration::from_secs(120)),
            },
            ProviderFailure {
                provider: "secondary".to_string(),
                reason: "rate limited after 3 attempts".to_string(),
                retry_in: Some(Duration::from_secs(20)),
            },
        ]);

        let text = err.to_string();
        assert!(text.contains("primary: circuit open"));
        assert!(text.contains("secondary: rate limited"));
        assert_eq!(err.retry_in(), Some(Duration::from_secs(20)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_provider_error_builders() {
        let err = ProviderError::rate_limited("slow down")
            .with_status(429)
            .with_retry_after(Duration::from_secs(7));
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(err.to_string(), "rate_limited error from provider: slow down");
    }
}
