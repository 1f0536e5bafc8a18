//! Retry with exponential backoff, guarded by a circuit breaker and paced by
//! a token bucket
//!
//! Whether an error is worth retrying is decided in one place,
//! [`is_retriable`]. Provider "retry after" hints win over the computed delay
//! when present; hints buried in free-text messages are extracted by
//! [`parse_retry_after`], which never fails (an unparseable message simply
//! yields `None`).

use crate::circuit_breaker::CircuitBreaker;
use crate::token_bucket::TokenBucket;
use regex::Regex;
use sluice_core::{ProviderError, ProviderErrorKind, Result, RetryConfig, SluiceError};
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message fragments that mark an otherwise unclassified error as transient
const RETRIABLE_TERMS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "quota",
    "too many requests",
    "service unavailable",
    "temporarily unavailable",
    "resource exhausted",
    "resource_exhausted",
    "overloaded",
];

/// Retry timing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.factor.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Computed delay after the failure of zero-based `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retrying `error`: the provider's hint if it gave one,
    /// otherwise the computed backoff; never longer than `max_delay`
    pub fn delay_after(&self, attempt: u32, error: &ProviderError) -> Duration {
        error
            .retry_after
            .or_else(|| parse_retry_after(&error.message))
            .map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for(attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Whether a provider error is transient and worth retrying
///
/// Rate-limit and unavailable kinds always are; malformed requests never
/// are. Unclassified errors are judged by status code and message text.
pub fn is_retriable(error: &ProviderError) -> bool {
    match error.kind {
        ProviderErrorKind::RateLimited | ProviderErrorKind::Unavailable => true,
        ProviderErrorKind::Malformed => false,
        ProviderErrorKind::Other => {
            if let Some(status) = error.status {
                if status == 408 || status == 429 || (500..600).contains(&status) {
                    return true;
                }
            }
            let message = error.message.to_lowercase();
            RETRIABLE_TERMS.iter().any(|term| message.contains(term))
        }
    }
}

fn retry_after_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:retry[-_ ]?after|retry[-_ ]?delay|try again in|retry in)["':=\s]*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?\b"#,
        )
        .expect("retry-after pattern is valid")
    })
}

/// Extract a "retry after" hint from free text
///
/// Understands forms like `retry after 12s`, `Retry-After: 30`,
/// `try again in 1.5 seconds`, `"retryDelay": "20s"` and `retry in 250ms`.
/// A bare number means seconds.
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    let captures = retry_after_regex().captures(text)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures
        .get(2)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();

    let secs = match unit.as_str() {
        "ms" | "millisecond" | "milliseconds" => value / 1000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
        _ => value,
    };
    Duration::try_from_secs_f64(secs).ok()
}

/// Retry executor shared by every provider of a router
#[derive(Debug, Clone, Default)]
pub struct BackoffRetrier {
    policy: BackoffPolicy,
}

impl BackoffRetrier {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts
    ///
    /// - Refuses immediately with [`SluiceError::CircuitOpen`] when the
    ///   breaker will not admit a call (no attempt is spent)
    /// - Takes a token from `bucket` before every attempt
    /// - On success: closes the breaker and lets the bucket recover
    /// - On a retriable error: backs the bucket off, records a breaker
    ///   failure, sleeps, and tries again
    /// - On a non-retriable error: returns [`SluiceError::Permanent`] at once
    ///
    /// Exhausting attempts (or the breaker opening mid-way) returns
    /// [`SluiceError::RetriesExhausted`] carrying the last error and the
    /// number of attempts made. Cancellation interrupts any wait.
    pub async fn execute<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        bucket: &TokenBucket,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let provider = breaker.name().to_string();
        let mut attempts = 0u32;
        let mut last_error: Option<ProviderError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(SluiceError::Cancelled);
            }

            if !breaker.try_acquire() {
                return Err(match last_error {
                    Some(source) => SluiceError::RetriesExhausted {
                        provider,
                        attempts,
                        source,
                    },
                    None => SluiceError::CircuitOpen {
                        retry_in: breaker.time_until_retry(),
                        provider,
                    },
                });
            }

            if let Err(e) = bucket
                .acquire_cancellable(1.0, bucket.default_max_wait(), cancel)
                .await
            {
                breaker.release_probe();
                return Err(e);
            }

            attempts += 1;
            debug!(provider = %provider, attempt = attempts, "Calling provider");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    breaker.release_probe();
                    return Err(SluiceError::Cancelled);
                }
                outcome = operation() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    breaker.record_success();
                    bucket.recover();
                    if attempts > 1 {
                        info!(provider = %provider, attempts, "Provider call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !is_retriable(&error) {
                breaker.release_probe();
                return Err(SluiceError::Permanent {
                    provider,
                    source: error,
                });
            }

            bucket.backoff();
            breaker.record_failure();

            // An open breaker would refuse the next attempt anyway
            if attempts >= self.policy.max_retries || breaker.is_refusing() {
                warn!(
                    provider = %provider,
                    attempts,
                    error = %error,
                    "Provider retries exhausted"
                );
                return Err(SluiceError::RetriesExhausted {
                    provider,
                    attempts,
                    source: error,
                });
            }

            let delay = self.policy.delay_after(attempts - 1, &error);
            warn!(
                provider = %provider,
                attempt = attempts,
                max_attempts = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retriable provider error; backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SluiceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            last_error = Some(error);
        }
    }
}
