//! Adaptive token bucket for pacing calls to a quota-limited resource
//!
//! Refill rate follows AIMD: [`TokenBucket::backoff`] halves it when the
//! resource reports overload, [`TokenBucket::recover`] grows it by 20% after a
//! success. The rate never drops below a quarter of the configured base rate
//! and never exceeds it.

use sluice_core::{RateLimitConfig, Result, SluiceError};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lowest refill rate, as a fraction of the base rate
const MIN_RATE_FRACTION: f64 = 0.25;
/// Multiplier applied by `recover`
const RECOVERY_FACTOR: f64 = 1.2;

/// Observation of a bucket at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub base_refill_rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refill_rate: f64,
    last_refill_at: Instant,
}

/// Rate limiter for one shared resource
///
/// One instance per resource, shared by every session through an `Arc`.
/// Only the token arithmetic is behind the mutex; waiting happens outside it.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    base_refill_rate: f64,
    default_max_wait: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// # Arguments
    ///
    /// * `name` - Resource name used in log events
    /// * `capacity` - Maximum burst of tokens
    /// * `refill_rate` - Tokens added per second at full speed
    pub fn new(name: impl Into<String>, capacity: f64, refill_rate: f64) -> Self {
        let capacity = capacity.max(f64::MIN_POSITIVE);
        let refill_rate = refill_rate.max(f64::MIN_POSITIVE);
        Self {
            name: name.into(),
            capacity,
            base_refill_rate: refill_rate,
            default_max_wait: Duration::from_secs(10),
            state: Mutex::new(BucketState {
                tokens: capacity,
                refill_rate,
                last_refill_at: Instant::now(),
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &RateLimitConfig) -> Self {
        let mut bucket = Self::new(name, config.capacity, config.refill_per_sec);
        bucket.default_max_wait = config.max_wait();
        bucket
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum wait used by [`acquire_one`](Self::acquire_one)
    pub fn default_max_wait(&self) -> Duration {
        self.default_max_wait
    }

    /// Take one token, waiting at most the configured maximum
    pub async fn acquire_one(&self) {
        self.acquire(1.0, self.default_max_wait).await;
    }

    /// Take `cost` tokens, waiting at most `max_wait`
    ///
    /// Never blocks longer than `max_wait`: if the bucket cannot cover the
    /// cost in time, the tokens are forced to zero and the call proceeds.
    pub async fn acquire(&self, cost: f64, max_wait: Duration) {
        // An uncancelled token never interrupts the wait
        let never = CancellationToken::new();
        let _ = self.acquire_cancellable(cost, max_wait, &never).await;
    }

    /// Like [`acquire`](Self::acquire), but aborts with
    /// [`SluiceError::Cancelled`] if `cancel` fires while waiting
    pub async fn acquire_cancellable(
        &self,
        cost: f64,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cost = cost.clamp(0.0, self.capacity);
        let started = Instant::now();
        let mut announced = false;

        loop {
            if cancel.is_cancelled() {
                return Err(SluiceError::Cancelled);
            }

            let waited = started.elapsed();
            let wait = {
                let mut state = self.lock();
                self.refill(&mut state);

                if state.tokens >= cost {
                    state.tokens -= cost;
                    return Ok(());
                }

                let wait = Duration::try_from_secs_f64((cost - state.tokens) / state.refill_rate)
                    .unwrap_or(Duration::MAX);
                if waited.saturating_add(wait) > max_wait {
                    warn!(
                        bucket = %self.name,
                        tokens = state.tokens,
                        capacity = self.capacity,
                        refill_rate = state.refill_rate,
                        waited_ms = waited.as_millis() as u64,
                        max_wait_ms = max_wait.as_millis() as u64,
                        "Token acquire timed out; proceeding without tokens"
                    );
                    state.tokens = 0.0;
                    return Ok(());
                }

                if !announced {
                    info!(
                        bucket = %self.name,
                        tokens = state.tokens,
                        capacity = self.capacity,
                        refill_rate = state.refill_rate,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited; waiting for tokens"
                    );
                    announced = true;
                }
                wait
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SluiceError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Halve the refill rate after the resource reported overload
    pub fn backoff(&self) {
        let mut state = self.lock();
        let before = state.refill_rate;
        state.refill_rate = (before / 2.0).max(self.min_refill_rate());
        info!(
            bucket = %self.name,
            before,
            after = state.refill_rate,
            "Refill rate backed off"
        );
    }

    /// Grow the refill rate back toward the base rate after a success
    pub fn recover(&self) {
        let mut state = self.lock();
        let before = state.refill_rate;
        let after = (before * RECOVERY_FACTOR).min(self.base_refill_rate);
        if after > before {
            state.refill_rate = after;
            info!(bucket = %self.name, before, after, "Refill rate recovered");
        } else {
            debug!(bucket = %self.name, rate = before, "Refill rate already at base");
        }
    }

    /// Current token level, capacity and rates (refilled to now)
    pub fn snapshot(&self) -> BucketSnapshot {
        let mut state = self.lock();
        self.refill(&mut state);
        BucketSnapshot {
            tokens: state.tokens,
            capacity: self.capacity,
            refill_rate: state.refill_rate,
            base_refill_rate: self.base_refill_rate,
        }
    }

    fn min_refill_rate(&self) -> f64 {
        self.base_refill_rate * MIN_RATE_FRACTION
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.refill_rate).min(self.capacity);
        state.last_refill_at = now;
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
