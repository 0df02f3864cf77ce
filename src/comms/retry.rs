//! Retry with configurable backoff and a circuit breaker
//!
//! The retry handler wraps one async operation: it consults the breaker
//! before every attempt, records the outcome with the breaker after every
//! attempt, and sleeps the strategy-computed delay between attempts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::comms::monitoring::PerformanceMetrics;

/// Backoff strategy tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// No delay between attempts
    Immediate,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay * base^(attempt - 1)`
    Exponential,
    /// `fib(attempt) * initial_delay`
    Fibonacci,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, the first included
    pub max_attempts: u32,
    /// Base delay fed into the strategy
    pub initial_delay: Duration,
    /// Cap applied to the computed delay
    pub max_delay: Duration,
    /// Base for the exponential strategy
    pub exponential_base: f64,
    /// Multiply the delay by a uniform factor in [0.5, 1.5)
    pub jitter: bool,
    /// Which schedule to use
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            strategy: RetryStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Single-attempt policy; useful where the caller handles failure itself
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Deterministic delay for a 1-indexed attempt, capped, before jitter
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = self.exponential_base.powi(attempt.saturating_sub(1) as i32);
                self.initial_delay.mul_f64(factor)
            }
            RetryStrategy::Fibonacci => self.initial_delay.saturating_mul(fibonacci(attempt)),
        };
        delay.min(self.max_delay)
    }

    /// Delay actually slept before the next attempt: capped, then jittered
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.raw_delay(attempt);
        if self.jitter && delay > Duration::ZERO {
            use rand::Rng;
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// `fib(1) = 1, fib(2) = 1, fib(n) = fib(n-1) + fib(n-2)`
fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Circuit breaker state tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failures exceeded the threshold; calls fail fast
    Open,
    /// Probing whether the downstream recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in closed state before opening
    pub failure_threshold: u32,
    /// Consecutive successes in half-open state before closing
    pub success_threshold: u32,
    /// How long the breaker stays open before the half-open probe
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Three-state guard that fast-fails calls to a downstream after repeated
/// failures. Transitions are serialized per breaker instance.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                opened_at: None,
            }),
        }
    }

    /// Whether calls should currently fail fast.
    ///
    /// The open-to-half-open transition is evaluated lazily here: once the
    /// open timeout has elapsed, the next check flips to half-open and
    /// admits a probe.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!("circuit breaker half-open, admitting probe");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Records a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failure_count = 0;
        inner.last_failure_at = None;
        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.success_count = 0;
                info!("circuit breaker closed");
            }
        }
    }

    /// Records a failed call.
    ///
    /// Returns `true` when this failure tripped the breaker open. Any
    /// failure in half-open state reopens it immediately.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failure_count += 1;
        inner.success_count = 0;
        inner.last_failure_at = Some(Instant::now());

        let should_open = inner.state == CircuitState::HalfOpen
            || (inner.state == CircuitState::Closed
                && inner.failure_count >= self.config.failure_threshold);
        if should_open && inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(failures = inner.failure_count, "circuit breaker opened");
            return true;
        }
        false
    }

    /// Current state, without evaluating the lazy half-open transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Forces the breaker back to closed with cleared counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.last_failure_at = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Failure surfaced by [`RetryHandler::execute`]
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The breaker rejected the call before the operation ran
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Every attempt failed; carries the last error
    #[error("operation failed after {attempts} attempts")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// The last attempt's error
        #[source]
        source: E,
    },
}

/// Retries an operation under a policy, shielded by a circuit breaker
pub struct RetryHandler {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<PerformanceMetrics>>,
}

impl RetryHandler {
    /// Creates a handler with the given policy and breaker
    #[must_use]
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy,
            breaker,
            metrics: None,
        }
    }

    /// Wires retry and breaker-trip counters into the given metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PerformanceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The breaker shielding this handler
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs `operation` until it succeeds or attempts are exhausted.
    ///
    /// The breaker is checked before every attempt; when open, the call
    /// fails fast with [`RetryError::CircuitOpen`] without invoking the
    /// operation.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if self.breaker.is_open() {
                warn!("circuit breaker open, rejecting call");
                return Err(RetryError::CircuitOpen);
            }

            match operation().await {
                Ok(value) => {
                    self.breaker.record_success();
                    if attempt > 1 {
                        info!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let tripped = self.breaker.record_failure();
                    if tripped {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_circuit_breaker_trip();
                        }
                    }
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "operation failed"
                    );

                    if attempt >= self.policy.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry();
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(delay_ms = delay.as_millis() as u64, "waiting before retry");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), Arc::new(CircuitBreaker::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: false,
            strategy,
        }
    }

    #[test]
    fn immediate_schedule_is_zero() {
        let policy = policy(RetryStrategy::Immediate);
        for attempt in 1..=5 {
            assert_eq!(policy.raw_delay(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn linear_schedule_scales_with_attempt() {
        let policy = policy(RetryStrategy::Linear);
        assert_eq!(policy.raw_delay(1), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(3), Duration::from_secs(3));
    }

    #[test]
    fn exponential_schedule_doubles() {
        let policy = policy(RetryStrategy::Exponential);
        assert_eq!(policy.raw_delay(1), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(2));
        assert_eq!(policy.raw_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn fibonacci_schedule_follows_the_sequence() {
        let policy = policy(RetryStrategy::Fibonacci);
        assert_eq!(policy.raw_delay(1), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(3), Duration::from_secs(2));
        assert_eq!(policy.raw_delay(4), Duration::from_secs(3));
        assert_eq!(policy.raw_delay(5), Duration::from_secs(5));
    }

    #[test]
    fn delays_are_capped_at_max() {
        let mut policy = policy(RetryStrategy::Exponential);
        policy.max_delay = Duration::from_secs(4);
        assert_eq!(policy.raw_delay(10), Duration::from_secs(4));
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..CircuitBreakerConfig::default()
        });
        assert!(!breaker.is_open());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count_in_closed_state() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_half_opens_after_timeout_then_closes_on_successes() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        });
        breaker.record_failure();
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn any_failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_timeout: Duration::from_secs(10),
        });
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.record_failure());
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_invokes_exactly_max_attempts_then_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let handler = RetryHandler::new(
            RetryPolicy {
                max_attempts: 4,
                jitter: false,
                initial_delay: Duration::from_millis(10),
                strategy: RetryStrategy::Immediate,
                ..RetryPolicy::default()
            },
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: 100,
                ..CircuitBreakerConfig::default()
            })),
        );

        let result: Result<(), RetryError<Boom>> = handler
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Boom) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_invoking_operation() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        breaker.record_failure();

        let handler = RetryHandler::new(RetryPolicy::default(), breaker);
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Boom>> = handler
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(RetryError::CircuitOpen)));
    }
}
