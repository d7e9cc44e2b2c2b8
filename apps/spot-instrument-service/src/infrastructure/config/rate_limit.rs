//! Inbound rate limiting configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::infrastructure::clock::SharedClock;
use crate::infrastructure::pipeline::{MethodRateLimiter, RateLimit};

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting is applied.
    #[serde(default = "super::default_true")]
    pub enabled: bool,
    /// Default refill rate for methods without an override.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    /// Default bucket capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Overrides keyed by full method path.
    #[serde(default)]
    pub methods: HashMap<String, RateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            methods: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Limit shared by methods without an override.
    #[must_use]
    pub const fn default_limit(&self) -> RateLimit {
        RateLimit::new(self.requests_per_second, self.burst)
    }

    /// Build the limiter, or `None` when disabled.
    #[must_use]
    pub fn build(&self, clock: SharedClock) -> Option<MethodRateLimiter> {
        if !self.enabled {
            return None;
        }
        let limiter = self.methods.iter().fold(
            MethodRateLimiter::new(self.default_limit(), clock),
            |limiter, (method, limit)| limiter.with_method_limit(method.clone(), *limit),
        );
        Some(limiter)
    }
}

const fn default_requests_per_second() -> f64 {
    100.0
}

const fn default_burst() -> u32 {
    200
}
