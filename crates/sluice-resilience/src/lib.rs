//! # sluice-resilience
//!
//! Fault tolerance for outbound provider calls.
//!
//! - [`TokenBucket`]: adaptive pacing for a quota-limited resource
//! - [`CircuitBreaker`]: stop calling a provider that keeps failing
//! - [`BackoffRetrier`]: bounded retries with exponential backoff
//! - [`ProviderRouter`]: ordered fallback across providers
//!
//! Concrete backends implement [`ProviderClient`]; [`AnthropicClient`] is the
//! one shipped here.

mod auth;
pub mod backoff;
mod circuit_breaker;
mod client;
mod provider;
mod router;
mod token_bucket;
mod types;

pub use auth::api_key_from_env;
pub use backoff::{is_retriable, parse_retry_after, BackoffPolicy, BackoffRetrier};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use client::AnthropicClient;
pub use provider::ProviderClient;
pub use router::{ProviderRouter, ProviderStats};
pub use token_bucket::{BucketSnapshot, TokenBucket};
pub use types::{CompletionRequest, CompletionResponse, Usage};
