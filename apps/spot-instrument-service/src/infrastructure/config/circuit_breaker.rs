//! Circuit breaker and retry settings for outbound clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::infrastructure::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Breaker and retry settings as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Trial calls allowed while half-open.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Counter reset period while closed.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Time spent open before probing.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Requests needed before the failure ratio is evaluated.
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u32,
    /// Failure ratio that trips the breaker.
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    /// Total attempts per call.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            minimum_requests: default_minimum_requests(),
            failure_ratio: default_failure_ratio(),
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Breaker configuration.
    #[must_use]
    pub const fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_requests: self.max_requests,
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            minimum_requests: self.minimum_requests,
            failure_ratio: self.failure_ratio,
        }
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

const fn default_max_requests() -> u32 {
    3
}

const fn default_interval_secs() -> u64 {
    10
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_minimum_requests() -> u32 {
    10
}

const fn default_failure_ratio() -> f64 {
    0.6
}

const fn default_attempts() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    100
}
