//! Retry and circuit-breaker behavior under a misbehaving downstream

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tenderflow::comms::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryError, RetryHandler, RetryPolicy,
    RetryStrategy,
};

#[derive(Debug, Error)]
#[error("technical agent unavailable")]
struct AgentDown;

fn no_retry_handler(breaker: Arc<CircuitBreaker>) -> RetryHandler {
    RetryHandler::new(
        RetryPolicy {
            max_attempts: 1,
            jitter: false,
            strategy: RetryStrategy::Immediate,
            ..RetryPolicy::default()
        },
        breaker,
    )
}

#[tokio::test(start_paused = true)]
async fn breaker_trips_after_five_failures_and_admits_probe_after_timeout() {
    // Default breaker config: failure_threshold 5.
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let handler = no_retry_handler(Arc::clone(&breaker));
    let calls = Arc::new(AtomicU32::new(0));

    // Five consecutive failures open the circuit.
    for _ in 0..5 {
        let calls = Arc::clone(&calls);
        let result: Result<(), RetryError<AgentDown>> = handler
            .execute(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentDown)
                }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { .. })));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(breaker.state(), CircuitState::Open);

    // The sixth request fails fast without invoking the agent.
    let result: Result<(), RetryError<AgentDown>> = {
        let calls = Arc::clone(&calls);
        handler
            .execute(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentDown)
                }
            })
            .await
    };
    assert!(matches!(result, Err(RetryError::CircuitOpen)));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // After the open timeout the next attempt is permitted (half-open probe).
    tokio::time::advance(Duration::from_secs(61)).await;
    let result: Result<(), RetryError<AgentDown>> = {
        let calls = Arc::clone(&calls);
        handler
            .execute(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
    };
    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn retries_follow_the_policy_then_surface_the_last_error() {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 100,
        ..CircuitBreakerConfig::default()
    }));
    let handler = RetryHandler::new(
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            exponential_base: 2.0,
            jitter: false,
            strategy: RetryStrategy::Exponential,
        },
        breaker,
    );

    let calls = Arc::new(AtomicU32::new(0));
    let start = tokio::time::Instant::now();
    let result: Result<(), RetryError<AgentDown>> = {
        let calls = Arc::clone(&calls);
        handler
            .execute(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentDown)
                }
            })
            .await
    };

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match result {
        Err(RetryError::Exhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.to_string(), "technical agent unavailable");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    // Two backoff sleeps: 50ms + 100ms (paused clock, exact).
    assert_eq!(start.elapsed(), Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_until_successes_close_it() {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        success_threshold: 2,
        open_timeout: Duration::from_secs(10),
    }));
    let handler = no_retry_handler(Arc::clone(&breaker));

    let fail = || async { Err::<(), AgentDown>(AgentDown) };
    let succeed = || async { Ok::<(), AgentDown>(()) };

    assert!(handler.execute(fail).await.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);

    // Probe fails: straight back to open.
    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(handler.execute(fail).await.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);

    // Probe succeeds twice: closed again.
    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(handler.execute(succeed).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(handler.execute(succeed).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}
