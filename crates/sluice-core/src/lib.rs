//! # sluice-core
//!
//! Core types for the Sluice tool-invocation pipeline.
//!
//! Sluice executes failure-prone work on behalf of many short-lived
//! conversational sessions: outbound model-provider calls, and reads and
//! writes of user datasets and derived artifacts. This crate holds what every
//! other crate shares:
//!
//! - [`SluiceError`] and the provider error contract
//! - [`SluiceConfig`], loaded from `.sluice/config.toml`
//! - [`SessionContext`], the typed per-conversation state
//! - [`fail_open`](fail_open::fail_open) for bookkeeping that must never fail an operation

pub mod config;
mod error;
pub mod fail_open;
mod session;
mod types;

pub use config::{
    BreakerConfig, GenerationPolicy, ProviderConfig, RateLimitConfig, ResolverConfig, RetryConfig,
    SluiceConfig, WorkspaceConfig,
};
pub use error::{ProviderError, ProviderErrorKind, ProviderFailure, Result, SluiceError};
pub use session::{InMemorySession, SessionContext, SessionState};
pub use types::SubareaKind;
