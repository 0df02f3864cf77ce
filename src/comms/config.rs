//! Configuration for the communication stack

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::comms::retry::{CircuitBreakerConfig, RetryPolicy, RetryStrategy};
use crate::domain_types::{MaxTraces, QueueBound};

/// Tunables shared by the broker, retry layer, and monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommsConfig {
    /// Recipient queue capacity; `None` means unbounded
    pub queue_bound: Option<QueueBound>,
    /// Policy applied around broker publishes
    pub retry_policy: RetryPolicy,
    /// Breaker shielding the publish path
    pub breaker: CircuitBreakerConfig,
    /// Trace retention cap
    pub max_traces: MaxTraces,
    /// Timeout used when a request does not specify one
    pub default_request_timeout: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            queue_bound: None,
            retry_policy: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            max_traces: MaxTraces::default(),
            default_request_timeout: Duration::from_secs(30),
        }
    }
}

impl CommsConfig {
    /// Short delays and a small trace cap, for local development
    #[must_use]
    pub fn development() -> Self {
        Self {
            retry_policy: RetryPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                ..RetryPolicy::default()
            },
            max_traces: MaxTraces::try_new(1_000).unwrap_or_default(),
            ..Self::default()
        }
    }

    /// Immediate retries and tiny timeouts, for tests
    #[must_use]
    pub fn testing() -> Self {
        Self {
            retry_policy: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                jitter: false,
                strategy: RetryStrategy::Immediate,
                ..RetryPolicy::default()
            },
            max_traces: MaxTraces::try_new(500).unwrap_or_default(),
            default_request_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}
