//! Circuit breaker for remote provider protection
//!
//! Implements the circuit breaker pattern to stop calling a provider that is
//! failing at runtime (rate limits, outages) and to probe it for recovery
//! once a cooldown has passed.

use serde::Serialize;
use sluice_core::BreakerConfig;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - reject requests immediately
    Open,
    /// Testing recovery - allow one request
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker, for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Milliseconds until a probe will be admitted, 0 if not open
    pub retry_in_ms: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one provider
///
/// # States
///
/// - **Closed**: Normal operation, all requests allowed
/// - **Open**: Too many failures, reject requests immediately
/// - **HalfOpen**: After the cooldown, exactly one probe request is admitted;
///   its outcome closes or re-opens the circuit
///
/// The Open → HalfOpen transition is lazy: it happens on the first
/// [`try_acquire`](Self::try_acquire) after the cooldown, not on a timer.
///
/// # Example
///
/// ```
/// use sluice_resilience::{CircuitBreaker, CircuitState};
/// use std::time::Duration;
///
/// let cb = CircuitBreaker::new("primary", 3, Duration::from_secs(300));
///
/// cb.record_failure();
/// cb.record_failure();
/// cb.record_failure();
///
/// assert_eq!(cb.state(), CircuitState::Open);
/// assert!(!cb.try_acquire());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// # Arguments
    ///
    /// * `name` - Provider name used in log events
    /// * `failure_threshold` - Consecutive failures before opening the circuit
    /// * `cooldown` - How long the circuit stays open before a probe
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.cooldown())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recorded state, without applying the lazy cooldown transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call right now would be refused
    ///
    /// Unlike [`try_acquire`](Self::try_acquire) this does not claim the
    /// half-open probe, so routers can use it to skip a provider without
    /// consuming its recovery attempt.
    pub fn is_refusing(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !self.cooldown_elapsed(&inner),
            CircuitState::HalfOpen => inner.probe_in_flight,
        }
    }

    /// Ask permission to make a call
    ///
    /// Returns `true` when the circuit is closed, or when this caller has
    /// been granted the single half-open probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(provider = %self.name, "Circuit half-open: admitting recovery probe");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call (closes the circuit, resets failure count)
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(provider = %self.name, from = %inner.state, "Circuit closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a retriable runtime failure
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        provider = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                warn!(
                    provider = %self.name,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Recovery probe failed; circuit re-opened"
                );
            }
            // Late failures from calls admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe whose outcome says nothing about health
    /// (for example, a malformed-request rejection)
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Get current failure count (for monitoring)
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time until a probe will be admitted, zero if not open
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.cooldown.saturating_sub(opened_at.elapsed())
            }
            // Closed and HalfOpen states have no cooldown pending
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let retry_in = self.time_until_retry();
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            retry_in_ms: retry_in.as_millis() as u64,
        }
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .map(|opened_at| opened_at.elapsed() >= self.cooldown)
            .unwrap_or(true)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        // 3 failures, 5 minute cooldown
        Self::from_config("default", &BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 3, Duration::from_secs(60))
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
        assert!(!cb.is_refusing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker();

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
        assert!(cb.is_refusing());
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker();

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        // Checking does not consume the probe
        assert!(!cb.is_refusing());
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire());
        assert!(cb.is_refusing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.try_acquire());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_restarts_cooldown() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(cb.try_acquire());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.time_until_retry(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cb.try_acquire());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_can_be_retaken() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.try_acquire());
        cb.release_probe();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_retry() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_secs(2));
        assert_eq!(cb.time_until_retry(), Duration::ZERO);

        cb.record_failure();
        cb.record_failure();

        let remaining = cb.time_until_retry();
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= Duration::from_secs(2));
        assert_eq!(cb.snapshot().retry_in_ms, 2000);
    }
}
