//! Ordered multi-provider routing with fallback
//!
//! The router walks its providers in priority order. A provider whose
//! breaker is open is skipped without being called; a provider that exhausts
//! its retries hands over to the next one. Only errors that no other
//! provider could fix (a rejected request, cancellation) stop the walk early.

use crate::backoff::{BackoffPolicy, BackoffRetrier};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::provider::ProviderClient;
use crate::token_bucket::TokenBucket;
use crate::types::{CompletionRequest, CompletionResponse};
use serde::Serialize;
use sluice_core::{ProviderFailure, Result, SluiceConfig, SluiceError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ProviderEntry {
    client: Arc<dyn ProviderClient>,
    breaker: CircuitBreaker,
    bucket: TokenBucket,
    served: AtomicU64,
    fallbacks: AtomicU64,
}

/// Per-provider counters, for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub model: String,
    pub breaker: BreakerSnapshot,
    /// Requests this provider answered
    pub served: u64,
    /// Times the router moved past this provider to the next one
    pub fallbacks: u64,
}

/// Routes completion requests across an ordered list of providers
///
/// Each provider owns one breaker and one token bucket; the retry policy is
/// shared. A router is built once and shared by every session.
pub struct ProviderRouter {
    providers: Vec<ProviderEntry>,
    retrier: BackoffRetrier,
}

impl ProviderRouter {
    pub fn new(retrier: BackoffRetrier) -> Self {
        Self {
            providers: Vec::new(),
            retrier,
        }
    }

    /// Build a router whose breakers, buckets and retry policy come from
    /// `config`; `clients` are tried in the order given
    pub fn from_config(config: &SluiceConfig, clients: Vec<Arc<dyn ProviderClient>>) -> Self {
        let mut router = Self::new(BackoffRetrier::new(BackoffPolicy::from_config(&config.retry)));
        for client in clients {
            let breaker = CircuitBreaker::from_config(client.name(), &config.breaker);
            let bucket = TokenBucket::from_config(client.name(), &config.rate_limit);
            router = router.with_provider(client, breaker, bucket);
        }
        router
    }

    /// Append a provider at the lowest priority
    pub fn with_provider(
        mut self,
        client: Arc<dyn ProviderClient>,
        breaker: CircuitBreaker,
        bucket: TokenBucket,
    ) -> Self {
        self.providers.push(ProviderEntry {
            client,
            breaker,
            bucket,
            served: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        });
        self
    }

    pub fn retrier(&self) -> &BackoffRetrier {
        &self.retrier
    }

    /// The breaker guarding `provider`, if it is registered
    pub fn breaker(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.entry(provider).map(|p| &p.breaker)
    }

    /// The token bucket pacing `provider`, if it is registered
    pub fn bucket(&self, provider: &str) -> Option<&TokenBucket> {
        self.entry(provider).map(|p| &p.bucket)
    }

    /// Send `request` to the first provider able to answer it
    ///
    /// # Errors
    ///
    /// - [`SluiceError::NoProviders`] if the router is empty
    /// - [`SluiceError::Permanent`] if a provider rejected the request itself
    /// - [`SluiceError::Cancelled`] if `cancel` fired
    /// - [`SluiceError::AllProvidersFailed`] with one reason per provider
    ///   when every provider was skipped or exhausted
    pub async fn call(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        if self.providers.is_empty() {
            return Err(SluiceError::NoProviders);
        }

        let mut failures = Vec::with_capacity(self.providers.len());

        for (index, entry) in self.providers.iter().enumerate() {
            let name = entry.client.name();

            let outcome = if entry.breaker.is_refusing() {
                debug!(provider = %name, "Circuit open; skipping provider");
                Err(SluiceError::CircuitOpen {
                    provider: name.to_string(),
                    retry_in: entry.breaker.time_until_retry(),
                })
            } else {
                self.retrier
                    .execute(&entry.breaker, &entry.bucket, cancel, || {
                        entry.client.send(request)
                    })
                    .await
            };

            let error = match outcome {
                Ok(response) => {
                    entry.served.fetch_add(1, Ordering::Relaxed);
                    if index > 0 {
                        info!(provider = %name, "Request served by fallback provider");
                    }
                    return Ok(response);
                }
                Err(e @ (SluiceError::Permanent { .. } | SluiceError::Cancelled)) => return Err(e),
                Err(e) => e,
            };

            let failure = ProviderFailure {
                provider: name.to_string(),
                reason: failure_reason(&error),
                retry_in: error.retry_in(),
            };

            if let Some(next) = self.providers.get(index + 1) {
                entry.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    from = %name,
                    to = %next.client.name(),
                    reason = %failure.reason,
                    "Provider unavailable; falling back to next provider"
                );
            }
            failures.push(failure);
        }

        warn!(providers = failures.len(), "All providers failed");
        Err(SluiceError::AllProvidersFailed(failures))
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers
            .iter()
            .map(|p| ProviderStats {
                name: p.client.name().to_string(),
                model: p.client.model().to_string(),
                breaker: p.breaker.snapshot(),
                served: p.served.load(Ordering::Relaxed),
                fallbacks: p.fallbacks.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn entry(&self, provider: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.client.name() == provider)
    }
}

fn failure_reason(error: &SluiceError) -> String {
    match error {
        SluiceError::CircuitOpen { .. } => "circuit open".to_string(),
        SluiceError::RetriesExhausted {
            attempts, source, ..
        } => format!("{} after {} attempt(s): {}", source.kind, attempts, source.message),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::provider::mock::ScriptedProvider;
    use sluice_core::ProviderError;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn single_attempt() -> BackoffRetrier {
        BackoffRetrier::new(BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
        })
    }

    fn breaker(name: &str) -> CircuitBreaker {
        CircuitBreaker::new(name, 3, Duration::from_secs(300))
    }

    fn bucket(name: &str) -> TokenBucket {
        TokenBucket::new(name, 100.0, 100.0)
    }

    fn router(
        retrier: BackoffRetrier,
        primary: &Arc<ScriptedProvider>,
        secondary: &Arc<ScriptedProvider>,
    ) -> ProviderRouter {
        ProviderRouter::new(retrier)
            .with_provider(primary.clone(), breaker("primary"), bucket("primary"))
            .with_provider(secondary.clone(), breaker("secondary"), bucket("secondary"))
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_open_primary_is_skipped_with_single_fallback_warning() {
        let primary = Arc::new(ScriptedProvider::always_err(
            "primary",
            ProviderError::rate_limited("429 Too Many Requests"),
        ));
        let secondary = Arc::new(ScriptedProvider::always_ok("secondary", "from secondary"));
        let router = router(single_attempt(), &primary, &secondary);
        let cancel = CancellationToken::new();
        let request = CompletionRequest::new("hello");

        // Three consecutive rate-limit failures open the primary's breaker
        let primary_breaker = router.breaker("primary").unwrap();
        let primary_bucket = router.bucket("primary").unwrap();
        for _ in 0..3 {
            let result = router
                .retrier()
                .execute(primary_breaker, primary_bucket, &cancel, || primary.send(&request))
                .await;
            assert!(result.is_err());
        }
        assert_eq!(primary_breaker.state(), CircuitState::Open);
        assert_eq!(primary.calls(), 3);

        // Within the cooldown the primary is not called at all
        let response = router.call(&request, &cancel).await.unwrap();
        assert_eq!(response.provider, "secondary");
        assert_eq!(response.text, "from secondary");
        assert_eq!(primary.calls(), 3);
        assert_eq!(secondary.calls(), 1);

        logs_assert(|lines: &[&str]| {
            let fallbacks = lines
                .iter()
                .filter(|line| line.contains("falling back"))
                .collect::<Vec<_>>();
            if fallbacks.len() != 1 {
                return Err(format!("expected 1 fallback warning, got {}", fallbacks.len()));
            }
            if !fallbacks[0].contains("WARN") {
                return Err(format!("fallback logged below warn: {}", fallbacks[0]));
            }
            Ok(())
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_primary_falls_back() {
        let primary = Arc::new(ScriptedProvider::always_err(
            "primary",
            ProviderError::unavailable("503 Service Unavailable"),
        ));
        let secondary = Arc::new(ScriptedProvider::always_ok("secondary", "ok"));
        let retrier = BackoffRetrier::new(BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_millis(100),
        });
        let router = router(retrier, &primary, &secondary);

        let response = router
            .call(&CompletionRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.provider, "secondary");
        assert_eq!(primary.calls(), 3);
        let stats = router.stats();
        assert_eq!(stats[0].fallbacks, 1);
        assert_eq!(stats[0].breaker.state, CircuitState::Open);
        assert_eq!(stats[1].served, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_routing() {
        let primary = Arc::new(ScriptedProvider::always_err(
            "primary",
            ProviderError::malformed("prompt too long"),
        ));
        let secondary = Arc::new(ScriptedProvider::always_ok("secondary", "ok"));
        let router = router(single_attempt(), &primary, &secondary);

        let result = router
            .call(&CompletionRequest::new("hi"), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SluiceError::Permanent { .. })));
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_failed_lists_each_reason() {
        let primary = Arc::new(ScriptedProvider::always_err(
            "primary",
            ProviderError::rate_limited("quota exceeded"),
        ));
        let secondary = Arc::new(ScriptedProvider::always_err(
            "secondary",
            ProviderError::unavailable("overloaded"),
        ));
        let router = router(single_attempt(), &primary, &secondary);

        let err = router
            .call(&CompletionRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            SluiceError::AllProvidersFailed(failures) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].provider, "primary");
                assert!(failures[0].reason.contains("quota exceeded"));
                assert_eq!(failures[1].provider, "secondary");
                assert!(failures[1].reason.contains("overloaded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_recovers_primary() {
        let primary = Arc::new(ScriptedProvider::scripted(
            "primary",
            vec![
                Err(ProviderError::rate_limited("slow down")),
                Err(ProviderError::rate_limited("slow down")),
                Err(ProviderError::rate_limited("slow down")),
            ],
            Ok("primary back".to_string()),
        ));
        let secondary = Arc::new(ScriptedProvider::always_ok("secondary", "ok"));
        let router = router(single_attempt(), &primary, &secondary);
        let cancel = CancellationToken::new();
        let request = CompletionRequest::new("hi");

        for _ in 0..3 {
            router.call(&request, &cancel).await.unwrap();
        }
        assert_eq!(router.breaker("primary").unwrap().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(300)).await;
        let response = router.call(&request, &cancel).await.unwrap();
        assert_eq!(response.provider, "primary");
        assert_eq!(router.breaker("primary").unwrap().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_empty_router() {
        let router = ProviderRouter::new(BackoffRetrier::default());
        let result = router
            .call(&CompletionRequest::new("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SluiceError::NoProviders)));
    }
}
